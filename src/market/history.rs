use crate::error::AppError;
use crate::market::protocol::WireNumber;
use crate::market::rest::BackendRestClient;
use crate::market::types::{normalize_exchange, normalize_symbol, Candle, IST_OFFSET_SECONDS};
use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const INTRADAY_LOOKBACK_DAYS: i64 = 30;
pub const DAILY_LOOKBACK_MONTHS: u32 = 24;
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "10m")]
    M10,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "D", alias = "1d")]
    Day,
    #[serde(rename = "W", alias = "1w")]
    Week,
    #[serde(rename = "M", alias = "1M")]
    Month,
}

impl HistoryInterval {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M10 => "10m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::Day => "D",
            Self::Week => "W",
            Self::Month => "M",
        }
    }

    /// Accepts backend codes and the chart's `1d`/`1w`/`1M` spellings.
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "10m" => Ok(Self::M10),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "D" | "1d" => Ok(Self::Day),
            "W" | "1w" => Ok(Self::Week),
            "M" | "1M" => Ok(Self::Month),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported history interval '{other}'"
            ))),
        }
    }

    pub fn is_intraday(self) -> bool {
        !matches!(self, Self::Day | Self::Week | Self::Month)
    }

    /// 30 days back for intraday intervals, two years otherwise.
    pub fn default_range(self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = if self.is_intraday() {
            today - ChronoDuration::days(INTRADAY_LOOKBACK_DAYS)
        } else {
            today
                .checked_sub_months(Months::new(DAILY_LOOKBACK_MONTHS))
                .unwrap_or(NaiveDate::MIN)
        };
        (start, today)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArgs {
    pub symbol: String,
    pub exchange: Option<String>,
    pub interval: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub zone_offset_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub symbol: String,
    pub exchange: String,
    pub interval: HistoryInterval,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub zone_offset_secs: i64,
}

impl HistoryArgs {
    pub fn normalize(self, today: NaiveDate) -> Result<HistoryRequest, AppError> {
        let interval = match self.interval.as_deref() {
            Some(raw) => HistoryInterval::parse_str(raw)?,
            None => HistoryInterval::Day,
        };
        let (default_start, default_end) = interval.default_range(today);
        let start_date = self.start_date.unwrap_or(default_start);
        let end_date = self.end_date.unwrap_or(default_end);
        if start_date > end_date {
            return Err(AppError::InvalidArgument(
                "startDate must not be after endDate".to_string(),
            ));
        }

        Ok(HistoryRequest {
            symbol: normalize_symbol(&self.symbol)?,
            exchange: normalize_exchange(self.exchange.as_deref().unwrap_or("NSE"))?,
            interval,
            start_date,
            end_date,
            zone_offset_secs: self.zone_offset_secs.unwrap_or(IST_OFFSET_SECONDS),
        })
    }
}

#[derive(Serialize)]
struct HistoryBody<'a> {
    apikey: &'a str,
    symbol: &'a str,
    exchange: &'a str,
    interval: &'static str,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponseWire {
    data: Option<Vec<HistoryRowWire>>,
}

#[derive(Debug, Deserialize)]
struct HistoryRowWire {
    timestamp: Option<WireNumber>,
    date: Option<String>,
    datetime: Option<String>,
    open: Option<WireNumber>,
    high: Option<WireNumber>,
    low: Option<WireNumber>,
    close: Option<WireNumber>,
}

fn price(field: &Option<WireNumber>) -> f64 {
    field
        .as_ref()
        .and_then(WireNumber::as_f64)
        .unwrap_or(f64::NAN)
}

/// Date strings carry no zone; they are read as UTC.
fn parse_date_secs(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp())
}

impl HistoryRowWire {
    fn to_candle(&self, zone_offset_secs: i64) -> Candle {
        let utc_secs = match &self.timestamp {
            Some(WireNumber::Number(secs)) if secs.is_finite() => Some(*secs as i64),
            _ => self
                .date
                .as_deref()
                .or(self.datetime.as_deref())
                .and_then(parse_date_secs),
        };

        Candle {
            time: utc_secs.map_or(0, |secs| secs + zone_offset_secs),
            open: price(&self.open),
            high: price(&self.high),
            low: price(&self.low),
            close: price(&self.close),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    Loaded(Vec<Candle>),
    /// Credentials rejected; the re-auth hook has already fired.
    Unauthorized,
    Cancelled,
    Failed(String),
}

impl HistoryOutcome {
    pub fn into_candles(self) -> Vec<Candle> {
        match self {
            Self::Loaded(candles) => candles,
            _ => Vec::new(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// One-shot historical candle requests against the authenticated backend.
#[derive(Debug, Clone)]
pub struct HistoricalFetcher {
    rest: BackendRestClient,
}

impl HistoricalFetcher {
    pub fn new(rest: BackendRestClient) -> Self {
        Self { rest }
    }

    pub async fn fetch(
        &self,
        api_key: &str,
        request: &HistoryRequest,
        cancel_token: &CancellationToken,
    ) -> HistoryOutcome {
        let body = HistoryBody {
            apikey: api_key,
            symbol: &request.symbol,
            exchange: &request.exchange,
            interval: request.interval.as_code(),
            start_date: request.start_date.format(DATE_FORMAT).to_string(),
            end_date: request.end_date.format(DATE_FORMAT).to_string(),
        };
        info!(
            symbol = %request.symbol,
            exchange = %request.exchange,
            interval = request.interval.as_code(),
            start_date = %body.start_date,
            end_date = %body.end_date,
            "requesting history"
        );

        let result = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!(symbol = %request.symbol, "history request cancelled");
                return HistoryOutcome::Cancelled;
            }
            result = self.rest.post_json::<_, HistoryResponseWire>("history", &body) => result,
        };

        match result {
            Ok(response) => {
                let candles: Vec<Candle> = response
                    .data
                    .unwrap_or_default()
                    .iter()
                    .map(|row| row.to_candle(request.zone_offset_secs))
                    .filter(Candle::is_valid)
                    .collect();
                debug!(symbol = %request.symbol, candles = candles.len(), "history loaded");
                HistoryOutcome::Loaded(candles)
            }
            Err(AppError::Unauthorized) => HistoryOutcome::Unauthorized,
            Err(error) => {
                error!(%error, symbol = %request.symbol, "history request failed");
                HistoryOutcome::Failed(error.to_string())
            }
        }
    }

    /// Uses today's UTC date for the default range.
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }
}
