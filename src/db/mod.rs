use crate::error::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DB_FILENAME_ENV: &str = "CHART_FEED_DB_FILENAME";
const DEFAULT_DB_FILENAME: &str = "chart-feed.db";

fn resolve_db_filename() -> String {
    std::env::var(DB_FILENAME_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

pub fn resolve_db_path(data_dir: &Path) -> Result<PathBuf, AppError> {
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join(resolve_db_filename()))
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(data_dir: &Path) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(data_dir)?;
    initialize_pool_from_path(&db_path).await
}

/// Single pinned connection so every query sees the same in-memory database.
pub async fn initialize_in_memory_pool() -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(connect_options)
        .await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_data_dir() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir().join(format!("chart-feed-{timestamp}"))
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let data_dir = unique_data_dir();

        let pool = initialize_pool(&data_dir)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let settings_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM client_settings")
            .fetch_one(&pool)
            .await
            .expect("client_settings table must exist and be queryable");

        assert_eq!(settings_rows, 0);

        drop(pool);
        let _ = std::fs::remove_dir_all(data_dir);
    }
}
