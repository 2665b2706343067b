use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use sha2::{Digest, Sha256};

use super::{AuthError, CredentialVerifier, Credentials, Principal, TokenKind};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;
use crate::types::UserToken;

#[must_use]
pub fn hash_user_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Creates a session token for `user_id` valid for `ttl`. Only the hash is
/// persisted; the raw token is returned once.
pub fn issue_user_token(
    store: &dyn Store,
    clock: &dyn Clock,
    user_id: &str,
    ttl: Duration,
) -> Result<(String, UserToken)> {
    let raw = TokenKind::UserSession.mint();

    let now = clock.now();
    let record = UserToken {
        token_hash: hash_user_token(&raw),
        user_id: user_id.to_string(),
        created_at: now,
        expires_at: now + ttl,
    };
    store.create_user_token(&record)?;
    Ok((raw, record))
}

/// Bearer session tokens, matched exactly by hash against non-expired records.
pub struct UserTokenVerifier {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl UserTokenVerifier {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl CredentialVerifier for UserTokenVerifier {
    fn name(&self) -> &'static str {
        "user_token"
    }

    async fn verify(&self, credentials: &Credentials) -> std::result::Result<Principal, AuthError> {
        let raw = credentials
            .bearer
            .as_deref()
            .filter(|t| TokenKind::UserSession.tags(t))
            .ok_or(AuthError::Missing)?;

        let record = self
            .store
            .get_user_token(&hash_user_token(raw))?
            .ok_or_else(|| AuthError::Rejected("unknown user token".to_string()))?;

        if record.expires_at <= self.clock.now() {
            return Err(AuthError::Rejected("user token expired".to_string()));
        }

        let user = self
            .store
            .get_user(&record.user_id)?
            .ok_or_else(|| AuthError::Rejected("user token owner missing".to_string()))?;

        Ok(Principal::user(user.id, user.global_role))
    }
}
