use crate::error::AppError;
use crate::market::credentials::CredentialStatus;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheck {
    pub authenticated: bool,
    pub reauth_required: bool,
    pub login_url: String,
}

pub async fn save_api_key(state: &AppState, api_key: String) -> Result<CredentialStatus, AppError> {
    let status = state.credentials.save_api_key(&api_key).await?;
    state.mark_reauthenticated();
    Ok(status)
}

pub async fn clear_api_key(state: &AppState) -> Result<bool, AppError> {
    state.credentials.clear_api_key().await
}

pub async fn credential_status(state: &AppState) -> Result<CredentialStatus, AppError> {
    state.credentials.status().await
}

/// Whether a usable key is stored, and where to log in when it is not.
pub async fn check_auth(state: &AppState) -> Result<AuthCheck, AppError> {
    let authenticated = state.credentials.is_authenticated().await;
    Ok(AuthCheck {
        authenticated,
        reauth_required: !authenticated || state.reauth_required(),
        login_url: state.rest.login_url().to_string(),
    })
}
