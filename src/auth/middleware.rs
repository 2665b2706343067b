use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::{Credentials, Principal};
use crate::server::AppState;
use crate::server::response::ApiError;

/// Extractor that requires a credential any registered verifier accepts.
/// What the principal may do is checked by the handler.
pub struct Authenticated(pub Principal);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let credentials = Credentials::from_headers(&parts.headers);
        let principal = state.resolver.resolve(&credentials).await?;
        Ok(Authenticated(principal))
    }
}
