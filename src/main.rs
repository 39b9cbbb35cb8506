//! Streams market data for a few symbols to the log.
//!
//! Usage:
//!   chart-feed --symbols RELIANCE,INFY --exchange NSE
//!   chart-feed --public --symbols BTCUSDT,ETHUSDT
//!
//! Environment:
//!   CHART_FEED_WS_URL, CHART_FEED_API_BASE, CHART_FEED_LOGIN_URL, CHART_FEED_TIME_URL
//!   CHART_FEED_API_KEY - stored before the feed starts
//!   RUST_LOG - log filter (default: info)

use chart_feed_lib::commands::{clock, credentials, market_feed};
use chart_feed_lib::config::Endpoints;
use chart_feed_lib::error::AppError;
use chart_feed_lib::market::feed::FeedEvent;
use chart_feed_lib::market::types::{FeedBackend, StartMarketFeedArgs, SubscriptionArgs};
use chart_feed_lib::time::sync::ClockSyncArgs;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chart-feed")]
#[command(about = "Market-data feed client with network clock correction")]
struct Args {
    /// Symbols to subscribe to (comma-separated)
    #[arg(long, env = "CHART_FEED_SYMBOLS", default_value = "RELIANCE")]
    symbols: String,

    /// Exchange for every symbol on the authenticated backend
    #[arg(long, env = "CHART_FEED_EXCHANGE", default_value = "NSE")]
    exchange: String,

    /// Use the public exchange stream instead of the authenticated backend
    #[arg(long)]
    public: bool,

    /// Overrides the websocket URL
    #[arg(long)]
    ws_url: Option<String>,

    /// Subscription mode: 1 = LTP, 2 = quote, 3 = depth
    #[arg(long, default_value = "2")]
    mode: u8,

    #[arg(long, env = "CHART_FEED_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory holding the settings database
    #[arg(long, env = "CHART_FEED_DATA_DIR", default_value = ".chart-feed")]
    data_dir: PathBuf,

    /// Clock resync interval in seconds
    #[arg(long, env = "CHART_FEED_SYNC_INTERVAL_SECS", default_value = "60")]
    sync_interval_secs: u64,

    #[arg(long, default_value = "5")]
    max_reconnect_attempts: u32,

    /// Fresh reconnect cycles allowed after the attempt budget runs out
    #[arg(long, default_value = "1")]
    reconnect_cycles: u32,
}

impl Args {
    fn feed_args(&self) -> StartMarketFeedArgs {
        let subscriptions = self
            .symbols
            .split(',')
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(|symbol| SubscriptionArgs {
                symbol: symbol.to_string(),
                exchange: Some(self.exchange.clone()),
            })
            .collect();

        StartMarketFeedArgs {
            backend: Some(if self.public {
                FeedBackend::Public
            } else {
                FeedBackend::Authenticated
            }),
            ws_url: self.ws_url.clone(),
            subscriptions: Some(subscriptions),
            mode: Some(self.mode),
            max_reconnect_attempts: Some(self.max_reconnect_attempts),
            ..StartMarketFeedArgs::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let state = chart_feed_lib::bootstrap(
        &args.data_dir,
        Endpoints::from_env(),
        ClockSyncArgs {
            authority_url: None,
            interval_secs: Some(args.sync_interval_secs),
        },
    )
    .await?;

    if let Some(api_key) = args.api_key.as_deref() {
        credentials::save_api_key(&state, api_key.to_string()).await?;
    }

    clock::clock_start(&state)?;
    let mut events = state.subscribe_feed_events();
    let session = market_feed::start_market_feed(&state, Some(args.feed_args())).await?;
    info!(
        backend = ?session.backend,
        url = %session.ws_url,
        symbols = session.subscriptions.len(),
        "streaming, press ctrl-c to stop"
    );

    let mut reconnects_left = args.reconnect_cycles;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event @ FeedEvent::Update(_)) => {
                    if let Some(ticker) = market_feed::market_ticker(&state, &event) {
                        info!(
                            symbol = %ticker.symbol,
                            exchange = %ticker.exchange,
                            last = ticker.last,
                            change = ticker.change,
                            change_percent = ticker.change_percent,
                            "tick"
                        );
                    }
                }
                Ok(FeedEvent::AuthFailed { message }) => {
                    error!(%message, "authentication rejected, store a new key with --api-key");
                    break;
                }
                Ok(FeedEvent::Unavailable) => {
                    if reconnects_left == 0 || !market_feed::reconnect_market_feed(&state).await? {
                        error!("feed unavailable, giving up");
                        break;
                    }
                    reconnects_left -= 1;
                    warn!(reconnects_left, "feed unavailable, starting a fresh reconnect cycle");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "log consumer fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    market_feed::stop_market_feed(&state).await?;
    clock::clock_stop(&state)?;
    info!("chart feed stopped");
    Ok(())
}
