use crate::config::Endpoints;
use crate::error::AppError;
use crate::market::binance;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYMBOL: &str = "RELIANCE";
pub const DEFAULT_PUBLIC_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_EXCHANGE: &str = "NSE";
pub const PUBLIC_EXCHANGE: &str = "BINANCE";
pub const DEFAULT_BACKEND: FeedBackend = FeedBackend::Authenticated;
pub const DEFAULT_SUBSCRIPTION_MODE: SubscriptionMode = SubscriptionMode::Quote;
pub const DEFAULT_TIMEFRAME: MarketTimeframe = MarketTimeframe::M1;
pub const IST_OFFSET_SECONDS: i64 = 19_800;
pub const DEFAULT_ZONE_OFFSET_SECS: i64 = IST_OFFSET_SECONDS;
pub const MIN_ZONE_OFFSET_SECS: i64 = -14 * 3_600;
pub const MAX_ZONE_OFFSET_SECS: i64 = 14 * 3_600;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const MAX_RECONNECT_ATTEMPTS_LIMIT: u32 = 20;
pub const MAX_SUBSCRIPTIONS: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Text shown by the status indicator.
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Offline",
            Self::Connecting => "Connecting",
            Self::Connected => "Live",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedBackend {
    Public,
    Authenticated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum SubscriptionMode {
    Ltp,
    Quote,
    Depth,
}

impl SubscriptionMode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ltp => 1,
            Self::Quote => 2,
            Self::Depth => 3,
        }
    }
}

impl TryFrom<u8> for SubscriptionMode {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ltp),
            2 => Ok(Self::Quote),
            3 => Ok(Self::Depth),
            other => Err(AppError::InvalidArgument(format!(
                "subscription mode must be 1, 2 or 3 (got {other})"
            ))),
        }
    }
}

impl From<SubscriptionMode> for u8 {
    fn from(value: SubscriptionMode) -> Self {
        value.as_u8()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl MarketTimeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            "1M" => Ok(Self::Mo1),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub symbol: String,
    pub exchange: String,
    pub mode: SubscriptionMode,
}

impl Subscription {
    pub fn new(symbol: &str, exchange: &str, mode: SubscriptionMode) -> Result<Self, AppError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            exchange: normalize_exchange(exchange)?,
            mode,
        })
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.symbol, self.exchange)
    }
}

/// Subscriptions in registration order; a symbol+exchange pair appears at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the symbol+exchange pair is already registered.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        let duplicate = self.entries.iter().any(|existing| {
            existing.symbol == subscription.symbol && existing.exchange == subscription.exchange
        });
        if duplicate {
            return false;
        }
        self.entries.push(subscription);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact match on the registered symbol; a frame without an exchange matches on symbol alone.
    pub fn find(&self, symbol: &str, exchange: Option<&str>) -> Option<&Subscription> {
        self.entries.iter().find(|entry| {
            entry.symbol == symbol && exchange.map_or(true, |value| entry.exchange == value)
        })
    }

    pub fn matches(&self, symbol: &str, exchange: Option<&str>) -> bool {
        self.find(symbol, exchange).is_some()
    }

    pub fn to_vec(&self) -> Vec<Subscription> {
        self.entries.clone()
    }
}

impl FromIterator<Subscription> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = Subscription>>(iter: I) -> Self {
        let mut set = Self::new();
        for subscription in iter {
            set.insert(subscription);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    Server,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketUpdate {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub prev_close: Option<f64>,
    pub timestamp_ms: i64,
    pub timestamp_source: TimestampSource,
}

impl MarketUpdate {
    pub fn broker_timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1_000)
    }

    pub fn to_candle(&self, zone_offset_secs: i64) -> Candle {
        Candle {
            time: self.broker_timestamp_secs() + zone_offset_secs,
            open: self.open.unwrap_or(self.last_price),
            high: self.high.unwrap_or(self.last_price),
            low: self.low.unwrap_or(self.last_price),
            close: self.last_price,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn is_valid(&self) -> bool {
        self.time > 0
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionArgs {
    pub symbol: String,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMarketFeedArgs {
    pub backend: Option<FeedBackend>,
    pub ws_url: Option<String>,
    pub subscriptions: Option<Vec<SubscriptionArgs>>,
    pub mode: Option<u8>,
    pub timeframe: Option<MarketTimeframe>,
    pub zone_offset_secs: Option<i64>,
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MarketFeedConfig {
    pub backend: FeedBackend,
    pub ws_url: String,
    pub subscriptions: SubscriptionSet,
    pub mode: SubscriptionMode,
    pub timeframe: MarketTimeframe,
    pub zone_offset_secs: i64,
    pub max_reconnect_attempts: u32,
}

impl StartMarketFeedArgs {
    pub fn normalize(self, endpoints: &Endpoints) -> Result<MarketFeedConfig, AppError> {
        let backend = self.backend.unwrap_or(DEFAULT_BACKEND);
        let mode = match self.mode {
            Some(raw) => SubscriptionMode::try_from(raw)?,
            None => DEFAULT_SUBSCRIPTION_MODE,
        };

        let requested = self.subscriptions.unwrap_or_default();
        if requested.len() > MAX_SUBSCRIPTIONS {
            return Err(AppError::InvalidArgument(format!(
                "at most {MAX_SUBSCRIPTIONS} subscriptions are allowed per feed"
            )));
        }

        let mut subscriptions = SubscriptionSet::new();
        for entry in requested {
            let exchange = match backend {
                FeedBackend::Public => PUBLIC_EXCHANGE.to_string(),
                FeedBackend::Authenticated => entry
                    .exchange
                    .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            };
            subscriptions.insert(Subscription::new(&entry.symbol, &exchange, mode)?);
        }
        if subscriptions.is_empty() {
            let (symbol, exchange) = match backend {
                FeedBackend::Public => (DEFAULT_PUBLIC_SYMBOL, PUBLIC_EXCHANGE),
                FeedBackend::Authenticated => (DEFAULT_SYMBOL, DEFAULT_EXCHANGE),
            };
            subscriptions.insert(Subscription::new(symbol, exchange, mode)?);
        }

        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let zone_offset_secs = self.zone_offset_secs.unwrap_or(DEFAULT_ZONE_OFFSET_SECS);
        if !(MIN_ZONE_OFFSET_SECS..=MAX_ZONE_OFFSET_SECS).contains(&zone_offset_secs) {
            return Err(AppError::InvalidArgument(format!(
                "zoneOffsetSecs must be between {MIN_ZONE_OFFSET_SECS} and {MAX_ZONE_OFFSET_SECS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS_LIMIT {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS_LIMIT}"
            )));
        }

        let ws_url = match self.ws_url.map(|value| value.trim().to_string()) {
            Some(url) if !url.is_empty() => url,
            _ => match backend {
                FeedBackend::Authenticated => endpoints.ws_url.clone(),
                FeedBackend::Public => public_stream_url(&subscriptions, timeframe),
            },
        };
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "wsUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        Ok(MarketFeedConfig {
            backend,
            ws_url,
            subscriptions,
            mode,
            timeframe,
            zone_offset_secs,
            max_reconnect_attempts,
        })
    }
}

fn public_stream_url(subscriptions: &SubscriptionSet, timeframe: MarketTimeframe) -> String {
    let symbols: Vec<&str> = subscriptions
        .iter()
        .map(|entry| entry.symbol.as_str())
        .collect();
    match symbols.as_slice() {
        [single] => binance::kline_stream_endpoint(single, timeframe),
        many => binance::mini_ticker_stream_endpoint(many),
    }
}

pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty()
        || !symbol
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '&'))
    {
        return Err(AppError::InvalidArgument(format!(
            "symbol '{raw}' must be non-empty ASCII (letters, digits, '-', '_', '&')"
        )));
    }
    Ok(symbol)
}

pub fn normalize_exchange(raw: &str) -> Result<String, AppError> {
    let exchange = raw.trim().to_ascii_uppercase();
    if exchange.is_empty()
        || !exchange
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(AppError::InvalidArgument(format!(
            "exchange '{raw}' must be non-empty alphanumeric ASCII"
        )));
    }
    Ok(exchange)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedSession {
    pub running: bool,
    pub backend: FeedBackend,
    pub ws_url: String,
    pub subscriptions: Vec<Subscription>,
    pub timeframe: MarketTimeframe,
    pub zone_offset_secs: i64,
    pub max_reconnect_attempts: u32,
}

impl MarketFeedSession {
    pub fn from_config(config: &MarketFeedConfig) -> Self {
        Self {
            running: true,
            backend: config.backend,
            ws_url: config.ws_url.clone(),
            subscriptions: config.subscriptions.to_vec(),
            timeframe: config.timeframe,
            zone_offset_secs: config.zone_offset_secs,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStatusSnapshot {
    pub state: ConnectionState,
    pub label: &'static str,
    pub running: bool,
    pub clock_offset_ms: Option<i64>,
    pub clock_synced: bool,
    pub auth_failed: bool,
}
