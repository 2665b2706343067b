//! Runner credentials.
//!
//! A runner service token is long-lived and stored salted and hashed. Hosts
//! exchange it for a short-lived, self-contained access token which the
//! resolver accepts on read endpoints.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{AuthError, CredentialVerifier, Credentials, Principal, TokenKind};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::RunnerToken;

const SALT_BYTES: usize = 16;

pub const ACCESS_TOKEN_ISSUER: &str = "railyard";
pub const ACCESS_TOKEN_AUDIENCE: &str = "railyard-runner";
pub const ACCESS_TOKEN_PURPOSE: &str = "runner";

fn salted_hash(salt: &[u8], token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Issues and verifies runner service tokens.
pub struct RunnerTokenService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RunnerTokenService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mints a token for `tenant_id`. The raw token is returned once.
    pub fn issue(
        &self,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(String, RunnerToken)> {
        let raw = TokenKind::Runner.mint();

        let record = self.register(tenant_id, &raw, expires_at)?;
        Ok((raw, record))
    }

    fn register(
        &self,
        tenant_id: &str,
        raw: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RunnerToken> {
        let prefix = TokenKind::Runner.lookup_prefix(raw).ok_or(Error::InvalidTokenFormat)?;

        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);

        let record = RunnerToken {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            token_prefix: prefix.to_string(),
            salt: hex::encode(salt),
            token_hash: hex::encode(salted_hash(&salt, raw)),
            created_at: self.clock.now(),
            expires_at,
            revoked_at: None,
        };
        self.store.create_runner_token(&record)?;
        Ok(record)
    }

    /// Finds the record for `raw`. Every candidate sharing the lookup prefix
    /// is compared in constant time, with no early exit on a match.
    pub fn verify(&self, raw: &str) -> std::result::Result<RunnerToken, AuthError> {
        if !TokenKind::Runner.tags(raw) {
            return Err(AuthError::Missing);
        }
        let prefix = TokenKind::Runner
            .lookup_prefix(raw)
            .ok_or_else(|| AuthError::Rejected("runner token too short".to_string()))?;

        let candidates = self.store.list_runner_tokens_by_prefix(prefix)?;

        let mut matched: Option<RunnerToken> = None;
        for candidate in candidates {
            let (Ok(salt), Ok(stored)) = (hex::decode(&candidate.salt), hex::decode(&candidate.token_hash))
            else {
                tracing::warn!(token_id = %candidate.id, "runner token record is corrupt");
                continue;
            };
            let equal: bool = salted_hash(&salt, raw).as_slice().ct_eq(stored.as_slice()).into();
            if equal && matched.is_none() {
                matched = Some(candidate);
            }
        }

        let record = matched.ok_or_else(|| AuthError::Rejected("unknown runner token".to_string()))?;

        if record.revoked_at.is_some() {
            return Err(AuthError::Rejected("runner token revoked".to_string()));
        }
        if record.expires_at.is_some_and(|exp| exp <= self.clock.now()) {
            return Err(AuthError::Rejected("runner token expired".to_string()));
        }

        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerAccessClaims {
    pub iss: String,
    pub aud: String,
    /// Tenant id.
    pub sub: String,
    pub purpose: String,
    /// Runner service token id.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and checks HS256 runner access tokens.
pub struct RunnerAccessTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RunnerAccessTokens {
    pub fn new(secret: &[u8], ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
            clock,
        }
    }

    #[must_use]
    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn issue(&self, tenant_id: &str, token_id: &str) -> Result<String> {
        let now = self.clock.now();
        let claims = RunnerAccessClaims {
            iss: ACCESS_TOKEN_ISSUER.to_string(),
            aud: ACCESS_TOKEN_AUDIENCE.to_string(),
            sub: tenant_id.to_string(),
            purpose: ACCESS_TOKEN_PURPOSE.to_string(),
            jti: token_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign runner access token: {e}")))
    }

    pub fn verify(&self, token: &str) -> std::result::Result<RunnerAccessClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ACCESS_TOKEN_ISSUER]);
        validation.set_audience(&[ACCESS_TOKEN_AUDIENCE]);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.required_spec_claims =
            HashSet::from(["exp", "iss", "aud", "sub"].map(str::to_string));

        let claims = jsonwebtoken::decode::<RunnerAccessClaims>(token, &self.decoding, &validation)
            .map_err(|e| AuthError::Rejected(format!("runner access token: {e}")))?
            .claims;

        if claims.purpose != ACCESS_TOKEN_PURPOSE {
            return Err(AuthError::Rejected("runner access token has wrong purpose".to_string()));
        }
        if claims.exp < self.clock.now().timestamp() {
            return Err(AuthError::Rejected("runner access token expired".to_string()));
        }
        if claims.sub.is_empty() {
            return Err(AuthError::Rejected("runner access token has no subject".to_string()));
        }

        Ok(claims)
    }
}

/// Accepts runner access tokens presented as bearer tokens.
pub struct RunnerAccessVerifier {
    tokens: Arc<RunnerAccessTokens>,
}

impl RunnerAccessVerifier {
    pub fn new(tokens: Arc<RunnerAccessTokens>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl CredentialVerifier for RunnerAccessVerifier {
    fn name(&self) -> &'static str {
        "runner_access"
    }

    async fn verify(&self, credentials: &Credentials) -> std::result::Result<Principal, AuthError> {
        let token = credentials
            .bearer
            .as_deref()
            .filter(|t| t.split('.').count() == 3)
            .ok_or(AuthError::Missing)?;

        let claims = self.tokens.verify(token)?;
        Ok(Principal::runner(claims.sub, claims.jti))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CapabilityKind, LOOKUP_PREFIX_LEN, RUNNER_TOKEN_PREFIX};
    use crate::clock::ManualClock;
    use crate::store::SqliteStore;
    use crate::types::Tenant;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<dyn Store>, Arc<ManualClock>) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        for id in ["t1", "t2"] {
            store
                .create_tenant(&Tenant {
                    id: id.to_string(),
                    name: id.to_string(),
                    source_repository: None,
                    public: false,
                    created_at: clock.now(),
                })
                .unwrap();
        }
        (temp, Arc::new(store), clock)
    }

    #[test]
    fn test_issue_and_verify() {
        let (_temp, store, clock) = setup();
        let service = RunnerTokenService::new(store, clock);

        let (raw, record) = service.issue("t1", None).unwrap();
        assert!(raw.starts_with(RUNNER_TOKEN_PREFIX));
        assert_eq!(raw.len(), RUNNER_TOKEN_PREFIX.len() + 43);
        assert_eq!(record.token_prefix, &raw[..LOOKUP_PREFIX_LEN]);
        assert!(!record.token_hash.contains(&raw));

        assert_eq!(service.verify(&raw).unwrap().id, record.id);
    }

    #[test]
    fn test_shared_prefix_never_cross_matches() {
        let (_temp, store, clock) = setup();
        let service = RunnerTokenService::new(store, clock);

        let shared = "ryrt_AAAAAAAAAAA";
        let first = format!("{shared}first-token-body-0000000000000000");
        let second = format!("{shared}second-token-body-000000000000000");

        let a = service.register("t1", &first, None).unwrap();
        let b = service.register("t2", &second, None).unwrap();
        assert_eq!(a.token_prefix, b.token_prefix);

        assert_eq!(service.verify(&first).unwrap().id, a.id);
        assert_eq!(service.verify(&second).unwrap().id, b.id);
        assert!(matches!(
            service.verify(&format!("{shared}third-token-body-0000000000000000")),
            Err(AuthError::Rejected(_))
        ));
    }

    #[test]
    fn test_revoked_and_expired_rejected() {
        let (_temp, store, clock) = setup();
        let service = RunnerTokenService::new(store.clone(), clock.clone());

        let (revoked, record) = service.issue("t1", None).unwrap();
        store.revoke_runner_token(&record.id, clock.now()).unwrap();
        assert!(matches!(service.verify(&revoked), Err(AuthError::Rejected(_))));

        let (expiring, _) = service
            .issue("t1", Some(clock.now() + Duration::minutes(5)))
            .unwrap();
        assert!(service.verify(&expiring).is_ok());
        clock.advance(Duration::minutes(5));
        assert!(matches!(service.verify(&expiring), Err(AuthError::Rejected(_))));
    }

    #[test]
    fn test_non_runner_token_is_missing() {
        let (_temp, store, clock) = setup();
        let service = RunnerTokenService::new(store, clock);
        assert!(matches!(service.verify("rydk_1234"), Err(AuthError::Missing)));
        assert!(matches!(service.verify("ryrt_short"), Err(AuthError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_access_token_roundtrip() {
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let tokens = Arc::new(RunnerAccessTokens::new(b"secret", 3600, clock.clone()));

        let jwt = tokens.issue("t1", "r1").unwrap();
        let verifier = RunnerAccessVerifier::new(tokens.clone());
        let principal = verifier.verify(&Credentials::bearer(jwt.clone())).await.unwrap();

        assert_eq!(principal.capability, CapabilityKind::ReadRunner);
        assert_eq!(principal.tenant_id.as_deref(), Some("t1"));
        assert_eq!(principal.subject_id, "r1");

        clock.advance(Duration::seconds(3600));
        assert!(tokens.verify(&jwt).is_ok());
        clock.advance(Duration::seconds(1));
        assert!(matches!(tokens.verify(&jwt), Err(AuthError::Rejected(_))));
    }

    #[test]
    fn test_access_token_wrong_secret_or_purpose() {
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let tokens = RunnerAccessTokens::new(b"secret", 3600, clock.clone());
        let other = RunnerAccessTokens::new(b"other", 3600, clock.clone());

        let jwt = other.issue("t1", "r1").unwrap();
        assert!(matches!(tokens.verify(&jwt), Err(AuthError::Rejected(_))));

        let claims = RunnerAccessClaims {
            iss: ACCESS_TOKEN_ISSUER.to_string(),
            aud: ACCESS_TOKEN_AUDIENCE.to_string(),
            sub: "t1".to_string(),
            purpose: "session".to_string(),
            jti: "r1".to_string(),
            iat: clock.now().timestamp(),
            exp: clock.now().timestamp() + 60,
        };
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(tokens.verify(&forged), Err(AuthError::Rejected(_))));
    }
}
