use crate::error::AppError;
use futures_util::future::BoxFuture;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;

const AUTHORITY_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";
const REQUESTED_WITH_HEADER: &str = "x-requested-with";
const REQUESTED_WITH_VALUE: &str = "XMLHttpRequest";

/// Local UTC clock in fractional seconds.
pub trait LocalClock: Send + Sync {
    fn now_secs(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_secs(&self) -> f64 {
        super::now_unix_secs_f64()
    }
}

/// Reference clock answering with its transmit time in UTC seconds.
pub trait TimeAuthority: Send + Sync {
    fn transmit_time<'a>(&'a self, client_secs: f64) -> BoxFuture<'a, Result<f64, AppError>>;
}

#[derive(Debug, Deserialize)]
struct AuthorityResponseWire {
    nstt: Option<f64>,
}

/// NTP-over-HTTP endpoint (`{url}?{client_secs}` returning `{"nstt": ...}`).
#[derive(Debug, Clone)]
pub struct HttpTimeAuthority {
    client: Client,
    url: String,
}

impl HttpTimeAuthority {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_url(&self, client_secs: f64) -> String {
        format!("{}?{client_secs:.3}", self.url)
    }

    async fn fetch(&self, client_secs: f64) -> Result<f64, AppError> {
        let response = self
            .client
            .get(self.request_url(client_secs))
            .header(ACCEPT, AUTHORITY_ACCEPT)
            .header(REQUESTED_WITH_HEADER, REQUESTED_WITH_VALUE)
            .send()
            .await?
            .error_for_status()?;

        let mut body = response.bytes().await?.to_vec();
        let payload: AuthorityResponseWire = simd_json::serde::from_slice(&mut body)?;
        payload
            .nstt
            .filter(|value| value.is_finite() && *value > 0.0)
            .ok_or(AppError::MissingField("nstt"))
    }
}

impl TimeAuthority for HttpTimeAuthority {
    fn transmit_time<'a>(&'a self, client_secs: f64) -> BoxFuture<'a, Result<f64, AppError>> {
        Box::pin(self.fetch(client_secs))
    }
}
