use crate::error::AppError;
use crate::market::types::{IST_OFFSET_SECONDS, MAX_ZONE_OFFSET_SECS, MIN_ZONE_OFFSET_SECS};
use crate::state::AppState;
use crate::time::sync::ClockOffset;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClockTimestamp {
    pub utc_secs: f64,
    pub zoned_secs: f64,
    pub zone_offset_secs: i64,
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClockStatus {
    #[serde(flatten)]
    pub offset: ClockOffset,
    pub running: bool,
    pub should_resync: bool,
}

/// Corrected current time; the zone defaults to IST.
pub fn clock_timestamp(
    state: &AppState,
    zone_offset_secs: Option<i64>,
) -> Result<ClockTimestamp, AppError> {
    let zone_offset_secs = zone_offset_secs.unwrap_or(IST_OFFSET_SECONDS);
    if !(MIN_ZONE_OFFSET_SECS..=MAX_ZONE_OFFSET_SECS).contains(&zone_offset_secs) {
        return Err(AppError::InvalidArgument(format!(
            "zoneOffsetSecs must be between {MIN_ZONE_OFFSET_SECS} and {MAX_ZONE_OFFSET_SECS}"
        )));
    }

    let utc_secs = state.clock_sync.accurate_utc_timestamp();
    Ok(ClockTimestamp {
        utc_secs,
        zoned_secs: utc_secs + zone_offset_secs as f64,
        zone_offset_secs,
        synced: state.clock_sync.is_synced(),
    })
}

pub async fn clock_sync_now(state: &AppState) -> Result<ClockStatus, AppError> {
    state.clock_sync.sync_now().await;
    clock_status(state)
}

pub fn clock_status(state: &AppState) -> Result<ClockStatus, AppError> {
    Ok(ClockStatus {
        offset: state.clock_sync.snapshot(),
        running: state.clock_sync.is_running(),
        should_resync: state.clock_sync.should_resync(),
    })
}

pub fn clock_start(state: &AppState) -> Result<bool, AppError> {
    Ok(state.clock_sync.start())
}

pub fn clock_stop(state: &AppState) -> Result<bool, AppError> {
    Ok(state.clock_sync.stop())
}
