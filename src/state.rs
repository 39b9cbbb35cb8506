use crate::config::Endpoints;
use crate::error::AppError;
use crate::market::credentials::CredentialStore;
use crate::market::feed::FeedEvent;
use crate::market::history::HistoricalFetcher;
use crate::market::rest::BackendRestClient;
use crate::market::socket::ManagedSocketClient;
use crate::market::status::ConnectionStatusBroadcaster;
use crate::market::ticker::PrevCloseCache;
use crate::market::types::MarketFeedSession;
use crate::time::sync::{ClockSyncConfig, ClockSyncService};
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

const FEED_EVENT_CAPACITY: usize = 1_024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct MarketFeedHandle {
    pub client: ManagedSocketClient,
    pub session: MarketFeedSession,
    pub consumer: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub endpoints: Endpoints,
    pub http_client: Client,
    pub credentials: CredentialStore,
    pub connection_status: ConnectionStatusBroadcaster,
    pub clock_sync: ClockSyncService,
    pub prev_close_cache: PrevCloseCache,
    pub rest: BackendRestClient,
    pub history: HistoricalFetcher,
    pub market_feed: Mutex<Option<MarketFeedHandle>>,
    pub feed_events: broadcast::Sender<FeedEvent>,
    pub(crate) reauth_required: Arc<AtomicBool>,
    /// Set when the running feed's handshake was rejected; cleared on the next start.
    pub(crate) feed_auth_failed: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        db_pool: SqlitePool,
        endpoints: Endpoints,
        clock_config: &ClockSyncConfig,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let reauth_required = Arc::new(AtomicBool::new(false));

        let hook_flag = Arc::clone(&reauth_required);
        let rest = BackendRestClient::new(http_client.clone(), &endpoints).with_reauth_hook(
            move |login_url| {
                hook_flag.store(true, Ordering::SeqCst);
                warn!(login_url, "session expired, log in again to continue");
            },
        );
        let (feed_events, _) = broadcast::channel(FEED_EVENT_CAPACITY);

        Ok(Self {
            started_at: Instant::now(),
            credentials: CredentialStore::new(db_pool.clone()),
            db_pool,
            clock_sync: ClockSyncService::from_config(http_client.clone(), clock_config),
            connection_status: ConnectionStatusBroadcaster::new(),
            prev_close_cache: PrevCloseCache::new(),
            history: HistoricalFetcher::new(rest.clone()),
            rest,
            endpoints,
            http_client,
            market_feed: Mutex::new(None),
            feed_events,
            reauth_required,
            feed_auth_failed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn subscribe_feed_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed_events.subscribe()
    }

    /// Set after the backend rejected the stored key; cleared when a new key is saved.
    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst)
    }

    pub fn mark_reauthenticated(&self) {
        self.reauth_required.store(false, Ordering::SeqCst);
    }

    pub fn mark_reauth_required(&self) {
        self.reauth_required.store(true, Ordering::SeqCst);
    }

    pub fn feed_auth_failed(&self) -> bool {
        self.feed_auth_failed.load(Ordering::SeqCst)
    }
}
