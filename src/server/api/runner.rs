use std::sync::Arc;

use axum::{Json, extract::State, http::HeaderMap};

use crate::auth::{AuthError, Credentials};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::RunnerTokenResponse;
use crate::server::response::ApiError;

/// Trades a long-lived runner service token for a short-lived access token.
pub async fn exchange_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RunnerTokenResponse>, ApiError> {
    let raw = Credentials::from_headers(&headers)
        .bearer
        .ok_or(Error::Unauthenticated)?;

    let record = match state.runner_tokens.verify(&raw) {
        Ok(record) => record,
        Err(AuthError::Internal(msg)) => return Err(Error::Internal(msg).into()),
        Err(e) => {
            tracing::debug!("Runner token exchange refused: {e}");
            return Err(Error::Unauthenticated.into());
        }
    };

    let access_token = state.runner_access.issue(&record.tenant_id, &record.id)?;
    tracing::info!(pack = %record.tenant_id, token = %record.id, "issued runner access token");

    Ok(Json(RunnerTokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.runner_access.ttl_secs(),
    }))
}
