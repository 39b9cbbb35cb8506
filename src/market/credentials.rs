use crate::error::AppError;
use crate::time::now_unix_ms;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

pub const API_KEY_SETTING: &str = "oa_apikey";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub authenticated: bool,
    pub updated_at_ms: Option<i64>,
}

/// API key of the authenticated backend, persisted in `client_settings`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Blank values count as absent.
    pub async fn api_key(&self) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT value FROM client_settings WHERE key = ?")
            .bind(API_KEY_SETTING)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(Some(value).filter(|key| !key.trim().is_empty()))
    }

    pub async fn require_api_key(&self) -> Result<String, AppError> {
        self.api_key().await?.ok_or(AppError::NotAuthenticated)
    }

    pub async fn save_api_key(&self, api_key: &str) -> Result<CredentialStatus, AppError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AppError::InvalidArgument(
                "api key must not be empty".to_string(),
            ));
        }

        let updated_at_ms = now_unix_ms();
        sqlx::query(
            "INSERT INTO client_settings (key, value, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(API_KEY_SETTING)
        .bind(api_key)
        .bind(updated_at_ms)
        .execute(&self.pool)
        .await?;

        info!("api key stored");
        Ok(CredentialStatus {
            authenticated: true,
            updated_at_ms: Some(updated_at_ms),
        })
    }

    /// Returns whether a key was removed.
    pub async fn clear_api_key(&self) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM client_settings WHERE key = ?")
            .bind(API_KEY_SETTING)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.api_key().await, Ok(Some(_)))
    }

    pub async fn status(&self) -> Result<CredentialStatus, AppError> {
        let row = sqlx::query("SELECT value, updated_at_ms FROM client_settings WHERE key = ?")
            .bind(API_KEY_SETTING)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(CredentialStatus {
                authenticated: false,
                updated_at_ms: None,
            });
        };
        let value: String = row.try_get("value")?;
        let updated_at_ms: i64 = row.try_get("updated_at_ms")?;
        Ok(CredentialStatus {
            authenticated: !value.trim().is_empty(),
            updated_at_ms: Some(updated_at_ms),
        })
    }
}
