use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use thiserror::Error;

use super::Principal;
use crate::error::Error;

/// Carries the federated CI identity token, kept apart from `Authorization`.
pub const OIDC_TOKEN_HEADER: &str = "x-oidc-token";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum AuthError {
    /// This verifier's credential kind is absent from the request.
    #[error("credential not present")]
    Missing,
    /// Present but not acceptable. The reason is logged, never returned.
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for AuthError {
    fn from(e: Error) -> Self {
        AuthError::Internal(e.to_string())
    }
}

/// Raw credential material pulled from one request.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub oidc_token: Option<String>,
    pub bearer: Option<String>,
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        Self {
            oidc_token: header(OIDC_TOKEN_HEADER).map(str::to_string),
            bearer: header(AUTHORIZATION.as_str())
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            api_key: header(API_KEY_HEADER).map(str::to_string),
        }
    }

    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.oidc_token.is_none() && self.bearer.is_none() && self.api_key.is_none()
    }
}

/// Verifies one credential kind.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError>;
}

/// Tries verifiers in registration order; the first success wins.
#[derive(Default)]
pub struct CredentialResolver {
    verifiers: Vec<Box<dyn CredentialVerifier>>,
}

impl CredentialResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, verifier: impl CredentialVerifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.verifiers.iter().map(|v| v.name()).collect()
    }

    pub async fn resolve(&self, credentials: &Credentials) -> crate::error::Result<Principal> {
        if credentials.is_empty() {
            return Err(Error::Unauthenticated);
        }

        for verifier in &self.verifiers {
            match verifier.verify(credentials).await {
                Ok(principal) => {
                    tracing::debug!(
                        verifier = verifier.name(),
                        capability = %principal.capability,
                        subject = %principal.subject_id,
                        "credential accepted"
                    );
                    return Ok(principal);
                }
                Err(AuthError::Missing) => {}
                Err(AuthError::Rejected(reason)) => {
                    tracing::debug!(verifier = verifier.name(), %reason, "credential rejected");
                }
                Err(AuthError::Upstream(msg)) => {
                    tracing::warn!(verifier = verifier.name(), error = %msg, "credential check failed upstream");
                    return Err(Error::Upstream(msg));
                }
                Err(AuthError::Internal(msg)) => {
                    tracing::error!(verifier = verifier.name(), error = %msg, "credential check failed");
                    return Err(Error::Internal(msg));
                }
            }
        }

        Err(Error::Unauthenticated)
    }
}
