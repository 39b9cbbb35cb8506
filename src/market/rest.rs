use crate::config::Endpoints;
use crate::error::AppError;
use crate::market::protocol::WireNumber;
use crate::market::ticker::{price_change, PrevCloseCache};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const API_PREFIX: &str = "/api/v1";

/// Invoked with the login URL whenever the backend answers 401.
pub type ReauthHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct BackendRestClient {
    client: Client,
    api_base_url: String,
    login_url: String,
    on_unauthorized: Option<ReauthHook>,
}

impl std::fmt::Debug for BackendRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRestClient")
            .field("api_base_url", &self.api_base_url)
            .field("login_url", &self.login_url)
            .finish()
    }
}

impl BackendRestClient {
    pub fn new(client: Client, endpoints: &Endpoints) -> Self {
        Self {
            client,
            api_base_url: endpoints.api_base_url.clone(),
            login_url: endpoints.login_url.clone(),
            on_unauthorized: None,
        }
    }

    pub fn with_reauth_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_unauthorized = Some(Arc::new(hook));
        self
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{API_PREFIX}/{path}", self.api_base_url)
    }

    fn signal_unauthorized(&self) {
        warn!(
            login_url = %self.login_url,
            "backend rejected credentials, re-authentication required"
        );
        if let Some(hook) = &self.on_unauthorized {
            hook(&self.login_url);
        }
    }

    pub(crate) async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AppError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.client.post(self.endpoint(path)).json(body).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.signal_unauthorized();
            return Err(AppError::Unauthorized);
        }
        if !status.is_success() {
            return Err(AppError::HttpStatus(status.as_u16()));
        }

        let mut bytes = response.bytes().await?.to_vec();
        Ok(simd_json::serde::from_slice(&mut bytes)?)
    }

    /// Last price and change against the previous close, which is remembered in `cache`.
    pub async fn quote(
        &self,
        api_key: &str,
        symbol: &str,
        exchange: &str,
        cache: &PrevCloseCache,
    ) -> Result<QuoteSnapshot, AppError> {
        let body = QuoteRequest {
            apikey: api_key,
            symbol,
            exchange,
        };
        let response: DataEnvelope<QuoteWire> = self.post_json("quotes", &body).await?;
        let quote = response.data.ok_or(AppError::MissingField("data"))?;
        let snapshot = quote.into_snapshot(symbol, exchange);
        cache.insert(symbol, exchange, snapshot.prev_close);
        debug!(symbol, exchange, last = snapshot.last_price, "quote loaded");
        Ok(snapshot)
    }

    /// Empty on any failure; a 401 also triggers the re-auth hook.
    pub async fn search_symbols(
        &self,
        api_key: &str,
        query: &str,
        exchange: Option<&str>,
        instrument_type: Option<&str>,
    ) -> Vec<SymbolMatch> {
        let body = SearchRequest {
            apikey: api_key,
            query,
            exchange: exchange.filter(|value| !value.is_empty()),
            instrumenttype: instrument_type.filter(|value| !value.is_empty()),
        };
        match self.post_json::<_, ListEnvelope<SymbolMatch>>("search", &body).await {
            Ok(envelope) => envelope.into_vec(),
            Err(AppError::Unauthorized) => Vec::new(),
            Err(error) => {
                error!(%error, query, "symbol search failed");
                Vec::new()
            }
        }
    }

    /// Interval codes supported by the broker, flattened across groups.
    pub async fn intervals(&self, api_key: &str) -> Vec<String> {
        let body = KeyOnlyRequest { apikey: api_key };
        match self.post_json::<_, IntervalEnvelope>("intervals", &body).await {
            Ok(envelope) => envelope.into_codes(),
            Err(AppError::Unauthorized) => Vec::new(),
            Err(error) => {
                error!(%error, "interval listing failed");
                Vec::new()
            }
        }
    }
}

#[derive(Serialize)]
struct KeyOnlyRequest<'a> {
    apikey: &'a str,
}

#[derive(Serialize)]
struct QuoteRequest<'a> {
    apikey: &'a str,
    symbol: &'a str,
    exchange: &'a str,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    apikey: &'a str,
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exchange: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instrumenttype: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListEnvelope<T> {
    Wrapped { data: Option<Vec<T>> },
    Bare(Vec<T>),
}

impl<T> ListEnvelope<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Wrapped { data } => data.unwrap_or_default(),
            Self::Bare(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntervalGroups {
    Flat(Vec<String>),
    Grouped(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Deserialize)]
struct IntervalEnvelope {
    data: Option<IntervalGroups>,
}

impl IntervalEnvelope {
    fn into_codes(self) -> Vec<String> {
        match self.data {
            Some(IntervalGroups::Flat(codes)) => codes,
            Some(IntervalGroups::Grouped(groups)) => groups.into_values().flatten().collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolMatch {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default, alias = "instrumenttype")]
    pub instrument_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteWire {
    ltp: Option<WireNumber>,
    last_price: Option<WireNumber>,
    open: Option<WireNumber>,
    prev_close: Option<WireNumber>,
    previous_close: Option<WireNumber>,
}

fn non_zero(field: &Option<WireNumber>) -> Option<f64> {
    field
        .as_ref()
        .and_then(WireNumber::as_f64)
        .filter(|value| *value != 0.0)
}

impl QuoteWire {
    fn into_snapshot(self, symbol: &str, exchange: &str) -> QuoteSnapshot {
        let last_price = non_zero(&self.ltp)
            .or_else(|| non_zero(&self.last_price))
            .unwrap_or(0.0);
        let prev_close = non_zero(&self.prev_close)
            .or_else(|| non_zero(&self.previous_close))
            .or_else(|| non_zero(&self.open))
            .unwrap_or(last_price);
        let (change, change_percent) = price_change(last_price, prev_close);

        QuoteSnapshot {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            last_price,
            prev_close,
            change,
            change_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub prev_close: f64,
    pub change: f64,
    pub change_percent: f64,
}
