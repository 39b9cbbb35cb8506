use crate::error::AppError;
use crate::market::binance::{fetch_klines, fetch_spot_symbols, BINANCE_REST_BASE_URL};
use crate::market::feed::{FeedEvent, FeedSession};
use crate::market::history::{HistoricalFetcher, HistoryArgs, HistoryOutcome};
use crate::market::rest::{QuoteSnapshot, SymbolMatch};
use crate::market::ticker::TickerSnapshot;
use crate::market::types::{
    normalize_symbol, Candle, FeedBackend, MarketFeedSession, MarketFeedStatusSnapshot,
    MarketFeedStopResult, MarketTimeframe, StartMarketFeedArgs, DEFAULT_ZONE_OFFSET_SECS,
};
use crate::state::{AppState, MarketFeedHandle};
use crate::time::TimeSource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteArgs {
    pub symbol: String,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchArgs {
    pub query: String,
    pub exchange: Option<String>,
    pub instrument_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicHistoryArgs {
    pub symbol: String,
    pub timeframe: Option<MarketTimeframe>,
    pub limit: Option<u16>,
    pub zone_offset_secs: Option<i64>,
}

const AUTH_FAILED_LABEL: &str = "Authentication failed";
const DEFAULT_PUBLIC_HISTORY_LIMIT: u16 = 500;
const MAX_PUBLIC_HISTORY_LIMIT: u16 = 5_000;

async fn take_feed(state: &AppState) -> Option<MarketFeedHandle> {
    let mut feed_slot = state.market_feed.lock().await;
    feed_slot.take()
}

async fn shutdown_feed(handle: MarketFeedHandle) {
    handle.client.shutdown().await;
    let _ = handle.consumer.await;
}

struct AuthFlags {
    reauth_required: Arc<AtomicBool>,
    feed_auth_failed: Arc<AtomicBool>,
}

impl AuthFlags {
    fn from_state(state: &AppState) -> Self {
        Self {
            reauth_required: Arc::clone(&state.reauth_required),
            feed_auth_failed: Arc::clone(&state.feed_auth_failed),
        }
    }
}

/// Flags are raised before the event is rebroadcast, so listeners reacting to
/// `AuthFailed` already see re-auth as required.
async fn forward_feed_events(
    mut events: mpsc::UnboundedReceiver<FeedEvent>,
    sink: broadcast::Sender<FeedEvent>,
    flags: AuthFlags,
) {
    while let Some(event) = events.recv().await {
        match &event {
            FeedEvent::Update(update) => {
                debug!(symbol = %update.symbol, price = update.last_price, "market update");
            }
            FeedEvent::AuthFailed { message } => {
                flags.feed_auth_failed.store(true, Ordering::SeqCst);
                flags.reauth_required.store(true, Ordering::SeqCst);
                warn!(%message, "feed authentication failed, credentials must be re-entered");
            }
            FeedEvent::Unavailable => warn!("market feed unavailable"),
        }
        let _ = sink.send(event);
    }
}

/// Replaces any running feed with a new one built from `args`.
pub async fn start_market_feed(
    state: &AppState,
    args: Option<StartMarketFeedArgs>,
) -> Result<MarketFeedSession, AppError> {
    let config = args.unwrap_or_default().normalize(&state.endpoints)?;

    if let Some(handle) = take_feed(state).await {
        shutdown_feed(handle).await;
    }

    let api_key = match config.backend {
        FeedBackend::Authenticated => Some(state.credentials.require_api_key().await?),
        FeedBackend::Public => None,
    };
    let clock: Arc<dyn TimeSource> = Arc::new(state.clock_sync.clone());
    let FeedSession { client, events } = FeedSession::open(
        &config,
        api_key,
        clock,
        state.connection_status.clone(),
    )?;
    state.feed_auth_failed.store(false, Ordering::SeqCst);
    let consumer = tokio::spawn(forward_feed_events(
        events,
        state.feed_events.clone(),
        AuthFlags::from_state(state),
    ));

    let session = MarketFeedSession::from_config(&config);
    {
        let mut feed_slot = state.market_feed.lock().await;
        *feed_slot = Some(MarketFeedHandle {
            client,
            session: session.clone(),
            consumer,
        });
    }

    Ok(session)
}

pub async fn stop_market_feed(state: &AppState) -> Result<MarketFeedStopResult, AppError> {
    let stopped = match take_feed(state).await {
        Some(handle) => {
            shutdown_feed(handle).await;
            true
        }
        None => false,
    };
    if stopped {
        info!("market feed stopped by command");
    }

    Ok(MarketFeedStopResult { stopped })
}

/// Restarts a feed that exhausted its reconnect budget.
pub async fn reconnect_market_feed(state: &AppState) -> Result<bool, AppError> {
    let feed_slot = state.market_feed.lock().await;
    Ok(feed_slot
        .as_ref()
        .is_some_and(|handle| handle.client.reconnect()))
}

pub async fn market_feed_status(state: &AppState) -> Result<MarketFeedStatusSnapshot, AppError> {
    let running = state.market_feed.lock().await.is_some();
    let current = state.connection_status.current();
    let clock = state.clock_sync.snapshot();
    let auth_failed = running && state.feed_auth_failed();

    Ok(MarketFeedStatusSnapshot {
        state: current,
        label: if auth_failed {
            AUTH_FAILED_LABEL
        } else {
            current.label()
        },
        running,
        clock_offset_ms: clock
            .synced
            .then(|| (clock.offset_seconds * 1_000.0).round() as i64),
        clock_synced: clock.synced,
        auth_failed,
    })
}

pub async fn market_history(
    state: &AppState,
    args: HistoryArgs,
    cancel_token: &CancellationToken,
) -> Result<HistoryOutcome, AppError> {
    let request = args.normalize(HistoricalFetcher::today())?;
    let Some(api_key) = state.credentials.api_key().await? else {
        state.mark_reauth_required();
        return Ok(HistoryOutcome::Unauthorized);
    };

    Ok(state.history.fetch(&api_key, &request, cancel_token).await)
}

pub async fn market_quote(state: &AppState, args: QuoteArgs) -> Result<QuoteSnapshot, AppError> {
    let api_key = state.credentials.require_api_key().await?;
    let exchange = args.exchange.as_deref().unwrap_or("NSE");
    state
        .rest
        .quote(&api_key, args.symbol.trim(), exchange, &state.prev_close_cache)
        .await
}

/// Watchlist row for a streamed update, using the remembered previous close when known.
pub fn market_ticker(state: &AppState, event: &FeedEvent) -> Option<TickerSnapshot> {
    match event {
        FeedEvent::Update(update) => Some(TickerSnapshot::from_update(
            update,
            &state.prev_close_cache,
        )),
        _ => None,
    }
}

pub async fn market_search(
    state: &AppState,
    args: SearchArgs,
) -> Result<Vec<SymbolMatch>, AppError> {
    let api_key = state.credentials.require_api_key().await?;
    Ok(state
        .rest
        .search_symbols(
            &api_key,
            args.query.trim(),
            args.exchange.as_deref(),
            args.instrument_type.as_deref(),
        )
        .await)
}

pub async fn market_intervals(state: &AppState) -> Result<Vec<String>, AppError> {
    let api_key = state.credentials.require_api_key().await?;
    Ok(state.rest.intervals(&api_key).await)
}

/// Candles from the public exchange, for charts fed by the public backend.
pub async fn public_history(
    state: &AppState,
    args: PublicHistoryArgs,
) -> Result<Vec<Candle>, AppError> {
    let symbol = normalize_symbol(&args.symbol)?;
    let limit = args.limit.unwrap_or(DEFAULT_PUBLIC_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_PUBLIC_HISTORY_LIMIT {
        return Err(AppError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_PUBLIC_HISTORY_LIMIT}"
        )));
    }

    fetch_klines(
        &state.http_client,
        BINANCE_REST_BASE_URL,
        &symbol,
        args.timeframe.unwrap_or(MarketTimeframe::M1),
        limit,
        args.zone_offset_secs.unwrap_or(DEFAULT_ZONE_OFFSET_SECS),
    )
    .await
}

pub async fn public_symbols(state: &AppState) -> Result<Vec<String>, AppError> {
    fetch_spot_symbols(&state.http_client, BINANCE_REST_BASE_URL).await
}
