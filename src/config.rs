pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_LOGIN_URL: &str = "http://127.0.0.1:5000/auth/login";
pub const DEFAULT_TIME_AUTHORITY_URL: &str = "https://www.nplindia.in/cgi-bin/ntp_client";

pub const WS_URL_ENV: &str = "CHART_FEED_WS_URL";
pub const API_BASE_URL_ENV: &str = "CHART_FEED_API_BASE";
pub const LOGIN_URL_ENV: &str = "CHART_FEED_LOGIN_URL";
pub const TIME_AUTHORITY_URL_ENV: &str = "CHART_FEED_TIME_URL";

/// Backend locations, overridable through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ws_url: String,
    pub api_base_url: String,
    pub login_url: String,
    pub time_authority_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            time_authority_url: DEFAULT_TIME_AUTHORITY_URL.to_string(),
        }
    }
}

impl Endpoints {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let resolve = |key: &str, fallback: &str| {
            lookup(key)
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };

        Self {
            ws_url: resolve(WS_URL_ENV, DEFAULT_WS_URL),
            api_base_url: resolve(API_BASE_URL_ENV, DEFAULT_API_BASE_URL),
            login_url: resolve(LOGIN_URL_ENV, DEFAULT_LOGIN_URL),
            time_authority_url: resolve(TIME_AUTHORITY_URL_ENV, DEFAULT_TIME_AUTHORITY_URL),
        }
    }
}
