pub mod clock;
pub mod credentials;
pub mod health;
pub mod market_feed;

#[cfg(test)]
pub(crate) async fn test_state() -> crate::state::AppState {
    test_state_with(crate::config::Endpoints::default()).await
}

#[cfg(test)]
pub(crate) async fn test_state_with(endpoints: crate::config::Endpoints) -> crate::state::AppState {
    use crate::time::sync::ClockSyncArgs;

    let clock_config = ClockSyncArgs::default()
        .normalize(&endpoints)
        .expect("default clock config should be valid");
    let pool = crate::db::initialize_in_memory_pool()
        .await
        .expect("in-memory pool should initialize");
    crate::state::AppState::new(pool, endpoints, &clock_config).expect("state should build")
}
