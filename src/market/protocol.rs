//! Wire frames exchanged with the feed backends.
//!
//! Inbound frames are decoded into loose wire structs first and then classified into
//! [`ServerMessage`] / [`PublicMessage`], so unknown shapes land in an explicit
//! `Unrecognized` variant instead of being sniffed field by field at the call site.

use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const AUTH_SUCCESS_STATUS: &str = "success";
pub const AUTHENTICATED_MARKER: &str = "authenticated";

/// Numbers on these feeds arrive either as JSON numbers or as numeric strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Number(value) => *value,
            Self::Text(text) => text.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    pub fn as_millis(&self) -> Option<i64> {
        self.as_f64()
            .filter(|value| *value > 0.0 && *value < i64::MAX as f64)
            .map(|value| value as i64)
    }

    fn describe(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

fn number(field: &Option<WireNumber>) -> Option<f64> {
    field.as_ref().and_then(WireNumber::as_f64)
}

#[derive(Debug, Default, Deserialize)]
struct ServerFrameWire {
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
    message: Option<String>,
    code: Option<WireNumber>,
    broker: Option<String>,
    symbol: Option<String>,
    exchange: Option<String>,
    data: Option<DataWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataWire {
    Market(MarketDataWire),
    Other(serde::de::IgnoredAny),
}

#[derive(Debug, Default, Deserialize)]
struct MarketDataWire {
    symbol: Option<String>,
    exchange: Option<String>,
    ltp: Option<WireNumber>,
    last_price: Option<WireNumber>,
    open: Option<WireNumber>,
    high: Option<WireNumber>,
    low: Option<WireNumber>,
    prev_close: Option<WireNumber>,
    timestamp: Option<WireNumber>,
}

/// Market data payload as sent by the authenticated backend, before subscription matching.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketDataFrame {
    pub symbol: Option<String>,
    pub exchange: Option<String>,
    pub last_price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub prev_close: Option<f64>,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthSuccess { broker: Option<String> },
    AuthFailure { message: String },
    Error { message: String },
    Ping,
    MarketData(MarketDataFrame),
    Unrecognized(String),
}

impl ServerMessage {
    fn from_wire(wire: ServerFrameWire) -> Self {
        let kind = wire.kind.as_deref();
        let status = wire.status.as_deref();

        if kind == Some("ping") {
            return Self::Ping;
        }

        let auth_success = (kind == Some("auth") && status == Some(AUTH_SUCCESS_STATUS))
            || kind == Some(AUTHENTICATED_MARKER)
            || status == Some(AUTHENTICATED_MARKER);
        if auth_success {
            return Self::AuthSuccess {
                broker: wire.broker,
            };
        }

        match kind {
            Some("auth") => Self::AuthFailure {
                message: failure_message(&wire, "authentication rejected"),
            },
            Some("error") => Self::Error {
                message: failure_message(&wire, "server error"),
            },
            Some("market_data") => {
                let data = match wire.data {
                    Some(DataWire::Market(data)) => data,
                    _ => MarketDataWire::default(),
                };
                let last_price = number(&data.ltp)
                    .filter(|price| *price != 0.0)
                    .or_else(|| number(&data.last_price));
                Self::MarketData(MarketDataFrame {
                    symbol: wire.symbol.or(data.symbol),
                    exchange: wire.exchange.or(data.exchange),
                    last_price,
                    open: number(&data.open),
                    high: number(&data.high),
                    low: number(&data.low),
                    prev_close: number(&data.prev_close),
                    timestamp_ms: data.timestamp.as_ref().and_then(WireNumber::as_millis),
                })
            }
            Some(other) => Self::Unrecognized(other.to_string()),
            None => Self::Unrecognized(status.unwrap_or("untyped").to_string()),
        }
    }
}

fn failure_message(wire: &ServerFrameWire, fallback: &str) -> String {
    let detail = wire
        .message
        .clone()
        .or_else(|| wire.status.clone())
        .unwrap_or_else(|| fallback.to_string());
    match &wire.code {
        Some(code) => format!("{detail} (code {})", code.describe()),
        None => detail,
    }
}

pub fn decode_server_message(payload: &mut [u8]) -> Result<ServerMessage, AppError> {
    let wire: ServerFrameWire = simd_json::serde::from_slice(payload)?;
    Ok(ServerMessage::from_wire(wire))
}

#[derive(Debug, Deserialize)]
struct PublicFrameWire {
    #[serde(rename = "e")]
    event_type: Option<String>,
    #[serde(rename = "E")]
    event_time: Option<WireNumber>,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "k")]
    kline: Option<KlineWire>,
    #[serde(rename = "o")]
    open: Option<WireNumber>,
    #[serde(rename = "h")]
    high: Option<WireNumber>,
    #[serde(rename = "l")]
    low: Option<WireNumber>,
    #[serde(rename = "c")]
    close: Option<WireNumber>,
    stream: Option<String>,
    data: Option<Box<PublicFrameWire>>,
}

#[derive(Debug, Deserialize)]
struct KlineWire {
    #[serde(rename = "t")]
    open_time: Option<WireNumber>,
    #[serde(rename = "o")]
    open: Option<WireNumber>,
    #[serde(rename = "h")]
    high: Option<WireNumber>,
    #[serde(rename = "l")]
    low: Option<WireNumber>,
    #[serde(rename = "c")]
    close: Option<WireNumber>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublicMessage {
    Kline {
        symbol: String,
        open_time_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
    MiniTicker {
        symbol: String,
        close: f64,
        open: Option<f64>,
        high: Option<f64>,
        low: Option<f64>,
        event_time_ms: Option<i64>,
    },
    Unrecognized(String),
}

impl PublicMessage {
    fn from_wire(wire: PublicFrameWire) -> Result<Self, AppError> {
        if let Some(inner) = wire.data {
            return Self::from_wire(*inner);
        }

        if let Some(kline) = wire.kline {
            let symbol = wire.symbol.ok_or(AppError::MissingField("s"))?;
            return Ok(Self::Kline {
                symbol,
                open_time_ms: kline
                    .open_time
                    .as_ref()
                    .and_then(WireNumber::as_millis)
                    .ok_or(AppError::MissingField("k.t"))?,
                open: number(&kline.open).ok_or(AppError::MissingField("k.o"))?,
                high: number(&kline.high).ok_or(AppError::MissingField("k.h"))?,
                low: number(&kline.low).ok_or(AppError::MissingField("k.l"))?,
                close: number(&kline.close).ok_or(AppError::MissingField("k.c"))?,
            });
        }

        match (wire.symbol, number(&wire.close)) {
            (Some(symbol), Some(close)) => Ok(Self::MiniTicker {
                symbol,
                close,
                open: number(&wire.open),
                high: number(&wire.high),
                low: number(&wire.low),
                event_time_ms: wire.event_time.as_ref().and_then(WireNumber::as_millis),
            }),
            _ => Ok(Self::Unrecognized(
                wire.event_type
                    .or(wire.stream)
                    .unwrap_or_else(|| "untyped".to_string()),
            )),
        }
    }
}

pub fn decode_public_message(payload: &mut [u8]) -> Result<PublicMessage, AppError> {
    let wire: PublicFrameWire = simd_json::serde::from_slice(payload)?;
    PublicMessage::from_wire(wire)
}

/// Requests the client sends on the authenticated feed.
#[derive(Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest<'a> {
    Authenticate {
        api_key: &'a str,
    },
    Subscribe {
        symbol: &'a str,
        exchange: &'a str,
        mode: u8,
    },
}

impl ClientRequest<'_> {
    pub fn to_frame(&self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(self)?)
    }
}

#[derive(Serialize)]
struct HeartbeatReply {
    #[serde(rename = "type")]
    kind: &'static str,
}

pub fn pong_frame() -> Result<String, AppError> {
    Ok(simd_json::serde::to_string(&HeartbeatReply { kind: "pong" })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> ServerMessage {
        let mut bytes = raw.as_bytes().to_vec();
        decode_server_message(&mut bytes).expect("frame should decode")
    }

    fn decode_public(raw: &str) -> PublicMessage {
        let mut bytes = raw.as_bytes().to_vec();
        decode_public_message(&mut bytes).expect("frame should decode")
    }

    #[test]
    fn recognizes_every_auth_success_shape() {
        assert_eq!(
            decode(r#"{"type":"auth","status":"success","broker":"zerodha"}"#),
            ServerMessage::AuthSuccess {
                broker: Some("zerodha".to_string())
            }
        );
        assert_eq!(
            decode(r#"{"type":"authenticated"}"#),
            ServerMessage::AuthSuccess { broker: None }
        );
        assert_eq!(
            decode(r#"{"status":"authenticated","message":"ok"}"#),
            ServerMessage::AuthSuccess { broker: None }
        );
    }

    #[test]
    fn auth_with_other_status_is_failure() {
        assert_eq!(
            decode(r#"{"type":"auth","status":"error","message":"Invalid API key","code":403}"#),
            ServerMessage::AuthFailure {
                message: "Invalid API key (code 403)".to_string()
            }
        );
    }

    #[test]
    fn classifies_error_and_ping_frames() {
        assert_eq!(
            decode(r#"{"type":"error","message":"rate limited"}"#),
            ServerMessage::Error {
                message: "rate limited".to_string()
            }
        );
        assert_eq!(decode(r#"{"type":"ping"}"#), ServerMessage::Ping);
    }

    #[test]
    fn market_data_accepts_numeric_strings_and_last_price_fallback() {
        let message = decode(
            r#"{"type":"market_data","symbol":"INFY","exchange":"NSE","mode":2,
                "data":{"ltp":0,"last_price":"1520.40","open":1500,"high":"1525.5","low":1498.2,
                        "prev_close":1495.0,"timestamp":1700000000123}}"#,
        );

        assert_eq!(
            message,
            ServerMessage::MarketData(MarketDataFrame {
                symbol: Some("INFY".to_string()),
                exchange: Some("NSE".to_string()),
                last_price: Some(1_520.40),
                open: Some(1_500.0),
                high: Some(1_525.5),
                low: Some(1_498.2),
                prev_close: Some(1_495.0),
                timestamp_ms: Some(1_700_000_000_123),
            })
        );
    }

    #[test]
    fn market_data_symbol_may_live_inside_payload() {
        let message = decode(r#"{"type":"market_data","data":{"symbol":"TCS","ltp":3999.5}}"#);

        match message {
            ServerMessage::MarketData(frame) => {
                assert_eq!(frame.symbol.as_deref(), Some("TCS"));
                assert_eq!(frame.exchange, None);
                assert_eq!(frame.timestamp_ms, None);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_unrecognized_not_errors() {
        assert_eq!(
            decode(r#"{"type":"subscribe","status":"success"}"#),
            ServerMessage::Unrecognized("subscribe".to_string())
        );
        assert_eq!(
            decode(r#"{"hello":"world"}"#),
            ServerMessage::Unrecognized("untyped".to_string())
        );
    }

    #[test]
    fn non_object_payload_does_not_hide_auth_ack() {
        assert_eq!(
            decode(r#"{"type":"auth","status":"success","data":"welcome"}"#),
            ServerMessage::AuthSuccess { broker: None }
        );
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut bytes = br#"{"type":"#.to_vec();
        assert!(decode_server_message(&mut bytes).is_err());
    }

    #[test]
    fn decodes_kline_event() {
        let message = decode_public(
            r#"{"e":"kline","E":1700000000500,"s":"BTCUSDT",
                "k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m",
                     "o":"37000.10","c":"37010.00","h":"37020.00","l":"36990.00","v":"12.5","x":false}}"#,
        );

        assert_eq!(
            message,
            PublicMessage::Kline {
                symbol: "BTCUSDT".to_string(),
                open_time_ms: 1_700_000_000_000,
                open: 37_000.10,
                high: 37_020.0,
                low: 36_990.0,
                close: 37_010.0,
            }
        );
    }

    #[test]
    fn decodes_combined_mini_ticker() {
        let message = decode_public(
            r#"{"stream":"ethusdt@miniTicker",
                "data":{"e":"24hrMiniTicker","E":1700000001000,"s":"ETHUSDT","c":"2050.5","o":"2000.0","h":"2060.0","l":"1990.0","v":"1","q":"2"}}"#,
        );

        assert_eq!(
            message,
            PublicMessage::MiniTicker {
                symbol: "ETHUSDT".to_string(),
                close: 2_050.5,
                open: Some(2_000.0),
                high: Some(2_060.0),
                low: Some(1_990.0),
                event_time_ms: Some(1_700_000_001_000),
            }
        );
    }

    #[test]
    fn kline_without_close_is_rejected() {
        let mut bytes =
            br#"{"e":"kline","s":"BTCUSDT","k":{"t":1700000000000,"o":"1","h":"1","l":"1"}}"#
                .to_vec();
        assert!(decode_public_message(&mut bytes).is_err());
    }

    #[test]
    fn encodes_client_requests() {
        assert_eq!(
            ClientRequest::Authenticate { api_key: "secret" }
                .to_frame()
                .expect("auth frame"),
            r#"{"action":"authenticate","api_key":"secret"}"#
        );
        assert_eq!(
            ClientRequest::Subscribe {
                symbol: "INFY",
                exchange: "NSE",
                mode: 2
            }
            .to_frame()
            .expect("subscribe frame"),
            r#"{"action":"subscribe","symbol":"INFY","exchange":"NSE","mode":2}"#
        );
        assert_eq!(pong_frame().expect("pong frame"), r#"{"type":"pong"}"#);
    }
}
