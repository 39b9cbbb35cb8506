use crate::market::types::MarketUpdate;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Previous-close prices learned from quote snapshots, keyed by `SYMBOL:EXCHANGE`.
///
/// Best effort only: streamed quotes do not carry the previous close, so until a quote has been
/// fetched for a symbol, change figures are measured against the session open instead.
#[derive(Debug, Clone, Default)]
pub struct PrevCloseCache {
    entries: Arc<RwLock<HashMap<String, f64>>>,
}

fn cache_key(symbol: &str, exchange: &str) -> String {
    format!(
        "{}:{}",
        symbol.to_ascii_uppercase(),
        exchange.to_ascii_uppercase()
    )
}

impl PrevCloseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: &str, exchange: &str, prev_close: f64) -> bool {
        if !(prev_close.is_finite() && prev_close > 0.0) {
            return false;
        }
        self.entries
            .write()
            .insert(cache_key(symbol, exchange), prev_close);
        true
    }

    pub fn get(&self, symbol: &str, exchange: &str) -> Option<f64> {
        self.entries.read().get(&cache_key(symbol, exchange)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// `(change, change_percent)`; percent is zero without a positive reference price.
pub fn price_change(last_price: f64, reference: f64) -> (f64, f64) {
    let change = last_price - reference;
    let percent = if reference > 0.0 {
        change / reference * 100.0
    } else {
        0.0
    };
    (change, percent)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickerSnapshot {
    pub symbol: String,
    pub exchange: String,
    pub last: f64,
    pub open: f64,
    pub change: f64,
    pub change_percent: f64,
}

impl TickerSnapshot {
    pub fn from_update(update: &MarketUpdate, cache: &PrevCloseCache) -> Self {
        let positive = |value: Option<f64>| value.filter(|price| price.is_finite() && *price > 0.0);
        let reference = cache
            .get(&update.symbol, &update.exchange)
            .or_else(|| positive(update.prev_close))
            .or_else(|| positive(update.open))
            .unwrap_or(update.last_price);
        let (change, change_percent) = price_change(update.last_price, reference);

        Self {
            symbol: update.symbol.clone(),
            exchange: update.exchange.clone(),
            last: update.last_price,
            open: positive(update.open).unwrap_or(reference),
            change,
            change_percent,
        }
    }
}
