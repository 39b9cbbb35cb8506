pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod state;
pub mod time;

#[cfg(test)]
mod test_support;

use config::Endpoints;
use db::initialize_pool;
use error::AppError;
use state::AppState;
use std::path::Path;
use time::sync::ClockSyncArgs;
use tracing::info;

/// Opens the settings store under `data_dir` and wires every service into one `AppState`.
pub async fn bootstrap(
    data_dir: &Path,
    endpoints: Endpoints,
    clock_args: ClockSyncArgs,
) -> Result<AppState, AppError> {
    let clock_config = clock_args.normalize(&endpoints)?;
    let db_pool = initialize_pool(data_dir).await?;
    let state = AppState::new(db_pool, endpoints, &clock_config)?;
    info!(
        data_dir = %data_dir.display(),
        ws_url = %state.endpoints.ws_url,
        api_base_url = %state.endpoints.api_base_url,
        "chart feed runtime ready"
    );
    Ok(state)
}
