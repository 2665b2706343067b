//! Federated CI identity tokens.
//!
//! Verification only establishes that the issuer signed the token for our
//! audience and that it is current. Binding the asserted repository to a
//! tenant is left to the caller, see [`OidcIdentity::matches_repository`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{AuthError, CredentialVerifier, Credentials, OidcIdentity, Principal};
use crate::clock::Clock;
use crate::retry::{RetryPolicy, send_with_retry};

pub const JWKS_CACHE_TTL_SECS: i64 = 300;
/// An unknown key id forces a refetch at most this often.
pub const JWKS_MIN_REFRESH_SECS: i64 = 30;
pub const CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("missing key id")]
    MissingKeyId,
    #[error("issuer mismatch")]
    IssuerMismatch,
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("signing key not found")]
    KeyNotFound,
    #[error("signature verification failed")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("key set fetch failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(a) => a == audience,
            Self::Many(all) => all.iter().any(|a| a == audience),
        }
    }
}

/// Verified claim set. Lives only for the request that presented it.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcClaims {
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub workflow_ref: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl OidcClaims {
    #[must_use]
    pub fn identity(&self) -> OidcIdentity {
        OidcIdentity {
            repository: self.repository.clone(),
            workflow_ref: self.workflow_ref.clone(),
            subject: self.sub.clone(),
        }
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Where the issuer's published key set comes from.
#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, OidcError>;
}

pub struct HttpJwksSource {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpJwksSource {
    pub fn new(url: impl Into<String>) -> Result<Self, OidcError> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()
            .map_err(|e| OidcError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            retry: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, OidcError> {
        let response = send_with_retry(&self.retry, || self.client.get(&self.url).send())
            .await
            .map_err(|e| OidcError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OidcError::Upstream(format!("key set endpoint returned {status}")));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| OidcError::Upstream(format!("invalid key set: {e}")))
    }
}

struct KeySnapshot {
    keys: HashMap<String, DecodingKey>,
    fetched_at: DateTime<Utc>,
}

/// Process-wide cache of the issuer's signing keys, keyed by key id.
///
/// Reads take a shared lock. At most one refresh is in flight; tasks that
/// queued behind it reuse its result instead of fetching again. Unknown key
/// ids inside [`JWKS_MIN_REFRESH_SECS`] of the last fetch are refused from
/// the cache.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    min_refresh: Duration,
    snapshot: RwLock<Option<Arc<KeySnapshot>>>,
    refresh: tokio::sync::Mutex<()>,
}

impl JwksCache {
    pub fn new(source: Arc<dyn JwksSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            ttl: Duration::seconds(JWKS_CACHE_TTL_SECS),
            min_refresh: Duration::seconds(JWKS_MIN_REFRESH_SECS),
            snapshot: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<KeySnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_fresh(&self, snapshot: &KeySnapshot) -> bool {
        self.clock.now() < snapshot.fetched_at + self.ttl
    }

    fn in_cooldown(&self, snapshot: &KeySnapshot) -> bool {
        self.clock.now() < snapshot.fetched_at + self.min_refresh
    }

    pub async fn key(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        let seen = self.current();
        if let Some(snapshot) = seen.as_ref().filter(|s| self.is_fresh(s)) {
            if let Some(key) = snapshot.keys.get(kid) {
                return Ok(key.clone());
            }
            if self.in_cooldown(snapshot) {
                tracing::debug!(%kid, "unknown key id, refresh cooling down");
                return Err(OidcError::KeyNotFound);
            }
        }

        let _guard = self.refresh.lock().await;

        if let Some(current) = self.current() {
            let replaced = seen.as_ref().is_none_or(|s| !Arc::ptr_eq(s, &current));
            if replaced && self.is_fresh(&current) {
                return current.keys.get(kid).cloned().ok_or(OidcError::KeyNotFound);
            }
        }

        let snapshot = Arc::new(self.fetch().await?);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());

        snapshot.keys.get(kid).cloned().ok_or(OidcError::KeyNotFound)
    }

    async fn fetch(&self) -> Result<KeySnapshot, OidcError> {
        let set = self.source.fetch().await?;

        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
                tracing::debug!(%kid, "skipping non-RSA key");
                continue;
            };
            match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => tracing::warn!(%kid, "skipping unusable key: {e}"),
            }
        }

        tracing::info!(keys = keys.len(), "refreshed identity provider key set");
        Ok(KeySnapshot {
            keys,
            fetched_at: self.clock.now(),
        })
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T, OidcError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| OidcError::Malformed(format!("{what} is not base64url")))?;
    serde_json::from_slice(&bytes).map_err(|e| OidcError::Malformed(format!("{what}: {e}")))
}

pub struct OidcVerifier {
    issuer: String,
    audience: String,
    keys: Arc<JwksCache>,
    clock: Arc<dyn Clock>,
}

impl OidcVerifier {
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        keys: Arc<JwksCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            keys,
            clock,
        }
    }

    /// Each step is a hard failure, checked in this order: shape, header,
    /// issuer, audience, key, signature, time bounds.
    pub async fn verify(&self, token: &str) -> Result<OidcClaims, OidcError> {
        let segments: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature] = segments.as_slice() else {
            return Err(OidcError::Malformed("expected three segments".to_string()));
        };

        let header: RawHeader = decode_segment(header_b64, "header")?;
        if header.alg != "RS256" {
            return Err(OidcError::UnsupportedAlgorithm);
        }
        let kid = header
            .kid
            .filter(|k| !k.is_empty())
            .ok_or(OidcError::MissingKeyId)?;

        let claims: OidcClaims = decode_segment(payload_b64, "payload")?;
        if claims.iss != self.issuer {
            return Err(OidcError::IssuerMismatch);
        }
        if !claims.aud.contains(&self.audience) {
            return Err(OidcError::AudienceMismatch);
        }

        let key = self.keys.key(&kid).await?;

        let message = &token[..header_b64.len() + 1 + payload_b64.len()];
        let valid = jsonwebtoken::crypto::verify(signature, message.as_bytes(), &key, Algorithm::RS256)
            .map_err(|_| OidcError::Signature)?;
        if !valid {
            return Err(OidcError::Signature);
        }

        self.check_time_bounds(&claims)?;
        Ok(claims)
    }

    fn check_time_bounds(&self, claims: &OidcClaims) -> Result<(), OidcError> {
        let now = self.clock.now().timestamp();

        if now > claims.exp + CLOCK_SKEW_SECS {
            return Err(OidcError::Expired);
        }
        if claims.nbf.is_some_and(|nbf| now + CLOCK_SKEW_SECS < nbf) {
            return Err(OidcError::NotYetValid);
        }
        if claims.iat.is_some_and(|iat| iat > now + CLOCK_SKEW_SECS) {
            return Err(OidcError::IssuedInFuture);
        }
        Ok(())
    }
}

/// Resolver strategy for the dedicated identity-token header.
pub struct OidcCredentialVerifier {
    verifier: Arc<OidcVerifier>,
}

impl OidcCredentialVerifier {
    pub fn new(verifier: Arc<OidcVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl CredentialVerifier for OidcCredentialVerifier {
    fn name(&self) -> &'static str {
        "oidc"
    }

    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        let token = credentials.oidc_token.as_deref().ok_or(AuthError::Missing)?;

        match self.verifier.verify(token).await {
            Ok(claims) => Ok(Principal::oidc(claims.identity())),
            Err(OidcError::Upstream(msg)) => Err(AuthError::Upstream(msg)),
            Err(e) => Err(AuthError::Rejected(format!("identity token: {e}"))),
        }
    }
}
