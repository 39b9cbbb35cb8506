use crate::config::Endpoints;
use crate::error::AppError;
use crate::market::types::IST_OFFSET_SECONDS;
use crate::time::authority::{HttpTimeAuthority, LocalClock, SystemClock, TimeAuthority};
use crate::time::TimeSource;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
pub const MIN_SYNC_INTERVAL_SECS: u64 = 5;
pub const MAX_SYNC_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClockSyncArgs {
    pub authority_url: Option<String>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockSyncConfig {
    pub authority_url: String,
    pub interval: Duration,
}

impl ClockSyncArgs {
    pub fn normalize(self, endpoints: &Endpoints) -> Result<ClockSyncConfig, AppError> {
        let authority_url = match self.authority_url.map(|value| value.trim().to_string()) {
            Some(url) if !url.is_empty() => url,
            _ => endpoints.time_authority_url.clone(),
        };
        if !(authority_url.starts_with("http://") || authority_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "authorityUrl must use the http:// or https:// scheme".to_string(),
            ));
        }

        let interval_secs = self.interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS);
        if !(MIN_SYNC_INTERVAL_SECS..=MAX_SYNC_INTERVAL_SECS).contains(&interval_secs) {
            return Err(AppError::InvalidArgument(format!(
                "intervalSecs must be between {MIN_SYNC_INTERVAL_SECS} and {MAX_SYNC_INTERVAL_SECS}"
            )));
        }

        Ok(ClockSyncConfig {
            authority_url,
            interval: Duration::from_secs(interval_secs),
        })
    }
}

/// Correction to apply to the local clock; kept as-is when a sync fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockOffset {
    pub offset_seconds: f64,
    pub last_sync_at: Option<f64>,
    pub synced: bool,
}

type InFlightSync = Shared<BoxFuture<'static, bool>>;

struct SchedulerHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

struct ClockSyncInner {
    authority: Arc<dyn TimeAuthority>,
    clock: Arc<dyn LocalClock>,
    interval: Duration,
    offset: RwLock<ClockOffset>,
    in_flight: Mutex<Option<InFlightSync>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl ClockSyncInner {
    async fn run_sync(&self) -> bool {
        let sent_at = self.clock.now_secs();
        let result = self.authority.transmit_time(sent_at).await;
        let received_at = self.clock.now_secs();

        match result {
            Ok(transmit_time) => {
                let latency = ((received_at - sent_at) / 2.0).max(0.0);
                let offset_seconds = transmit_time + latency - received_at;
                *self.offset.write() = ClockOffset {
                    offset_seconds,
                    last_sync_at: Some(received_at),
                    synced: true,
                };
                debug!(
                    offset_secs = offset_seconds,
                    latency_ms = latency * 1_000.0,
                    "clock synced with time authority"
                );
                true
            }
            Err(error) => {
                warn!(%error, "clock sync failed, keeping previous offset");
                false
            }
        }
    }
}

/// Keeps a correction offset between the local clock and a network time authority.
///
/// Clones share one offset, one in-flight request and one scheduler.
#[derive(Clone)]
pub struct ClockSyncService {
    inner: Arc<ClockSyncInner>,
}

impl std::fmt::Debug for ClockSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSyncService")
            .field("offset", &*self.inner.offset.read())
            .field("interval", &self.inner.interval)
            .finish()
    }
}

impl ClockSyncService {
    pub fn new(
        authority: Arc<dyn TimeAuthority>,
        clock: Arc<dyn LocalClock>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClockSyncInner {
                authority,
                clock,
                interval,
                offset: RwLock::new(ClockOffset::default()),
                in_flight: Mutex::new(None),
                scheduler: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(client: Client, config: &ClockSyncConfig) -> Self {
        Self::new(
            Arc::new(HttpTimeAuthority::new(client, config.authority_url.clone())),
            Arc::new(SystemClock),
            config.interval,
        )
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn snapshot(&self) -> ClockOffset {
        *self.inner.offset.read()
    }

    pub fn offset_seconds(&self) -> f64 {
        self.inner.offset.read().offset_seconds
    }

    pub fn is_synced(&self) -> bool {
        self.inner.offset.read().synced
    }

    pub fn last_sync_at(&self) -> Option<f64> {
        self.inner.offset.read().last_sync_at
    }

    /// Resolves to whether the sync succeeded. Callers arriving while a request is
    /// outstanding share its result instead of issuing another one.
    ///
    /// The request runs on its own task, so it completes with fresh timestamps even when
    /// every caller stops waiting for it.
    pub fn sync_now(&self) -> impl Future<Output = bool> + Send + 'static {
        let mut slot = self.inner.in_flight.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let synced = inner.run_sync().await;
            *inner.in_flight.lock() = None;
            synced
        });
        let request: BoxFuture<'static, bool> = Box::pin(async move {
            match task.await {
                Ok(synced) => synced,
                Err(error) => {
                    warn!(%error, "clock sync task ended abnormally");
                    false
                }
            }
        });
        let shared = request.shared();
        *slot = Some(shared.clone());
        shared
    }

    /// True before the first successful sync and once a full interval has passed since.
    pub fn should_resync(&self) -> bool {
        match self.last_sync_at() {
            Some(last) => self.inner.clock.now_secs() - last >= self.inner.interval.as_secs_f64(),
            None => true,
        }
    }

    pub fn accurate_utc_timestamp(&self) -> f64 {
        self.inner.clock.now_secs() + self.offset_seconds()
    }

    pub fn accurate_zoned_timestamp(&self, zone_offset_secs: i64) -> f64 {
        self.accurate_utc_timestamp() + zone_offset_secs as f64
    }

    pub fn accurate_ist_timestamp(&self) -> f64 {
        self.accurate_zoned_timestamp(IST_OFFSET_SECONDS)
    }

    /// Syncs immediately, then once per interval. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.is_some() {
            debug!("clock sync scheduler already running");
            return false;
        }

        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        let join_handle = tokio::spawn(async move {
            run_scheduler(weak, interval, task_token).await;
        });

        *scheduler = Some(SchedulerHandle {
            cancel_token,
            join_handle,
        });
        info!(interval_secs = interval.as_secs(), "clock sync scheduler started");
        true
    }

    /// Returns false when the scheduler was not running.
    pub fn stop(&self) -> bool {
        let Some(handle) = self.inner.scheduler.lock().take() else {
            return false;
        };
        handle.cancel_token.cancel();
        drop(handle.join_handle);
        info!("clock sync scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.lock().is_some()
    }
}

impl TimeSource for ClockSyncService {
    fn now_ms(&self) -> i64 {
        (self.accurate_utc_timestamp() * 1_000.0).round() as i64
    }
}

async fn run_scheduler(
    service: Weak<ClockSyncInner>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = service.upgrade() else {
            break;
        };
        let sync = ClockSyncService { inner }.sync_now();
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = sync => {}
        }
    }
}
