pub mod authority;
pub mod sync;

use std::time::{SystemTime, UNIX_EPOCH};

pub use authority::{HttpTimeAuthority, LocalClock, SystemClock, TimeAuthority};
pub use sync::{ClockOffset, ClockSyncArgs, ClockSyncConfig, ClockSyncService};

/// Wall-clock reading used to stamp updates that carry no server time.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        now_unix_ms()
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub fn now_unix_secs_f64() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs_f64(),
        Err(_) => 0.0,
    }
}
