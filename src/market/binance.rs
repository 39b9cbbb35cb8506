use crate::error::AppError;
use crate::market::types::{Candle, MarketTimeframe};
use reqwest::Client;
use serde::Deserialize;

pub const BINANCE_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443";
pub const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
const BINANCE_MAX_KLINES_PER_REQUEST: usize = 1_000;

pub fn kline_stream_endpoint(symbol: &str, timeframe: MarketTimeframe) -> String {
    format!(
        "{BINANCE_STREAM_BASE_URL}/ws/{}@kline_{}",
        symbol.to_ascii_lowercase(),
        timeframe.as_str()
    )
}

pub fn mini_ticker_stream_endpoint(symbols: &[&str]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|symbol| format!("{}@miniTicker", symbol.to_ascii_lowercase()))
        .collect();
    format!("{BINANCE_STREAM_BASE_URL}/stream?streams={}", streams.join("/"))
}

fn klines_endpoint(
    rest_base_url: &str,
    symbol: &str,
    timeframe: MarketTimeframe,
    limit: u16,
    end_time: Option<i64>,
) -> String {
    let mut endpoint = format!("{rest_base_url}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={}&limit={limit}",
            symbol.to_ascii_uppercase(),
            timeframe.as_str()
        );
    if let Some(value) = end_time {
        endpoint.push_str(&format!("&endTime={value}"));
    }
    endpoint
}

fn spot_symbols_endpoint(rest_base_url: &str) -> String {
    format!("{rest_base_url}/api/v3/exchangeInfo?permissions=SPOT")
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
#[derive(Debug, Deserialize)]
struct KlineRowWire(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    serde::de::IgnoredAny,
    serde::de::IgnoredAny,
    serde::de::IgnoredAny,
    serde::de::IgnoredAny,
    serde::de::IgnoredAny,
);

impl KlineRowWire {
    fn to_candle(&self, zone_offset_secs: i64) -> Result<Candle, AppError> {
        let candle = Candle {
            time: self.0.div_euclid(1_000) + zone_offset_secs,
            open: self.1.parse::<f64>()?,
            high: self.2.parse::<f64>()?,
            low: self.3.parse::<f64>()?,
            close: self.4.parse::<f64>()?,
        };
        if !candle.is_valid() {
            return Err(AppError::InvalidArgument(
                "kline values must be finite with a positive open time".to_string(),
            ));
        }
        Ok(candle)
    }
}

/// Public-backend history, oldest first, paging backwards until `limit` candles are collected.
pub async fn fetch_klines(
    client: &Client,
    rest_base_url: &str,
    symbol: &str,
    timeframe: MarketTimeframe,
    limit: u16,
    zone_offset_secs: i64,
) -> Result<Vec<Candle>, AppError> {
    let target_limit = usize::from(limit);
    let mut remaining = target_limit;
    let mut end_time: Option<i64> = None;
    let mut klines: Vec<KlineRowWire> = Vec::with_capacity(target_limit);

    while remaining > 0 {
        let request_limit = remaining.min(BINANCE_MAX_KLINES_PER_REQUEST) as u16;
        let endpoint = klines_endpoint(rest_base_url, symbol, timeframe, request_limit, end_time);
        let response = client.get(endpoint).send().await?.error_for_status()?;
        let mut payload = response.json::<Vec<KlineRowWire>>().await?;
        if payload.is_empty() {
            break;
        }

        let oldest_open_time = payload.first().map(|kline| kline.0).unwrap_or_default();
        let page_len = payload.len();
        remaining = remaining.saturating_sub(page_len);
        klines.append(&mut payload);

        if oldest_open_time <= 0 || page_len < usize::from(request_limit) {
            break;
        }
        end_time = Some(oldest_open_time - 1);
    }

    klines.sort_unstable_by_key(|kline| kline.0);
    klines.dedup_by_key(|kline| kline.0);

    if klines.len() > target_limit {
        let overflow = klines.len() - target_limit;
        klines.drain(0..overflow);
    }

    klines
        .iter()
        .map(|kline| kline.to_candle(zone_offset_secs))
        .collect()
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoWire {
    symbols: Vec<ExchangeSymbolWire>,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbolWire {
    symbol: String,
    status: String,
    #[serde(rename = "isSpotTradingAllowed")]
    is_spot_trading_allowed: bool,
}

pub async fn fetch_spot_symbols(
    client: &Client,
    rest_base_url: &str,
) -> Result<Vec<String>, AppError> {
    let endpoint = spot_symbols_endpoint(rest_base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<ExchangeInfoWire>().await?;

    let mut symbols: Vec<String> = payload
        .symbols
        .into_iter()
        .filter(|entry| {
            entry.is_spot_trading_allowed && entry.status.eq_ignore_ascii_case("TRADING")
        })
        .map(|entry| entry.symbol)
        .collect();

    symbols.sort_unstable();
    symbols.dedup();
    Ok(symbols)
}
