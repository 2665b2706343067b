use std::sync::Arc;

use async_trait::async_trait;

use super::{AuthError, CapabilityKind, CredentialVerifier, Credentials, KeyHasher, Principal, TokenKind};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;

/// Binding recorded alongside a static API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyMetadata {
    pub tenant_id: String,
    pub capability: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyVerification {
    pub valid: bool,
    pub key_id: Option<String>,
    pub metadata: Option<ApiKeyMetadata>,
}

impl ApiKeyVerification {
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            valid: false,
            key_id: None,
            metadata: None,
        }
    }
}

/// Key store consulted for static API keys.
pub trait ApiKeyStore: Send + Sync {
    fn verify_key(&self, raw: &str) -> Result<ApiKeyVerification>;
}

/// Deploy keys in the local database, Argon2id-hashed with an indexed lookup.
pub struct DeployKeyStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    hasher: KeyHasher,
}

impl DeployKeyStore {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            store,
            clock,
            hasher: KeyHasher::new()?,
        })
    }
}

impl ApiKeyStore for DeployKeyStore {
    fn verify_key(&self, raw: &str) -> Result<ApiKeyVerification> {
        let Some(lookup) = TokenKind::DeployKey.lookup_prefix(raw) else {
            return Ok(ApiKeyVerification::invalid());
        };

        let Some(key) = self.store.get_deploy_key_by_lookup(lookup)? else {
            return Ok(ApiKeyVerification::invalid());
        };

        if !self.hasher.verify(raw, &key.key_hash)? || key.revoked_at.is_some() {
            return Ok(ApiKeyVerification::invalid());
        }

        if let Err(e) = self.store.update_deploy_key_last_used(&key.id, self.clock.now()) {
            tracing::warn!("Failed to update deploy key last_used_at: {e}");
        }

        Ok(ApiKeyVerification {
            valid: true,
            key_id: Some(key.id),
            metadata: Some(ApiKeyMetadata {
                tenant_id: key.tenant_id,
                capability: key.capability,
            }),
        })
    }
}

/// Static API key verifier. Reads `X-API-Key`, falling back to a bearer token
/// that carries the deploy key tag. Fails closed unless the key store returns
/// metadata whose capability is exactly `required`.
pub struct ApiKeyVerifier {
    keys: Arc<dyn ApiKeyStore>,
    required: CapabilityKind,
}

impl ApiKeyVerifier {
    pub fn new(keys: Arc<dyn ApiKeyStore>, required: CapabilityKind) -> Self {
        Self { keys, required }
    }
}

#[async_trait]
impl CredentialVerifier for ApiKeyVerifier {
    fn name(&self) -> &'static str {
        "api_key"
    }

    async fn verify(&self, credentials: &Credentials) -> std::result::Result<Principal, AuthError> {
        let raw = credentials
            .api_key
            .as_deref()
            .or_else(|| {
                credentials
                    .bearer
                    .as_deref()
                    .filter(|t| TokenKind::DeployKey.tags(t))
            })
            .ok_or(AuthError::Missing)?;

        // Argon2 verification is CPU-bound.
        let keys = self.keys.clone();
        let raw = raw.to_string();
        let verification = tokio::task::spawn_blocking(move || keys.verify_key(&raw))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))??;

        if !verification.valid {
            return Err(AuthError::Rejected("api key not valid".to_string()));
        }
        let metadata = verification
            .metadata
            .ok_or_else(|| AuthError::Rejected("api key has no metadata".to_string()))?;
        if metadata.capability != self.required.as_str() {
            return Err(AuthError::Rejected(format!(
                "api key capability '{}' does not match '{}'",
                metadata.capability, self.required
            )));
        }

        let key_id = verification.key_id.unwrap_or_default();
        Ok(Principal::deploy(metadata.tenant_id, key_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DEPLOY_KEY_PREFIX, RUNNER_TOKEN_PREFIX};
    use crate::clock::SystemClock;
    use crate::store::SqliteStore;
    use crate::types::{DeployKey, Tenant};
    use chrono::Utc;
    use tempfile::TempDir;

    struct StaticKeys(ApiKeyVerification);

    impl ApiKeyStore for StaticKeys {
        fn verify_key(&self, _raw: &str) -> Result<ApiKeyVerification> {
            Ok(self.0.clone())
        }
    }

    fn api_key(raw: &str) -> Credentials {
        Credentials {
            api_key: Some(raw.to_string()),
            ..Credentials::default()
        }
    }

    #[tokio::test]
    async fn test_missing_metadata_fails_closed() {
        let keys = Arc::new(StaticKeys(ApiKeyVerification {
            valid: true,
            key_id: Some("k1".to_string()),
            metadata: None,
        }));
        let verifier = ApiKeyVerifier::new(keys, CapabilityKind::PublishDeploy);

        assert!(matches!(
            verifier.verify(&api_key("anything")).await,
            Err(AuthError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_mismatch_fails_closed() {
        let keys = Arc::new(StaticKeys(ApiKeyVerification {
            valid: true,
            key_id: Some("k1".to_string()),
            metadata: Some(ApiKeyMetadata {
                tenant_id: "t1".to_string(),
                capability: "read_user".to_string(),
            }),
        }));
        let verifier = ApiKeyVerifier::new(keys, CapabilityKind::PublishDeploy);

        assert!(matches!(
            verifier.verify(&api_key("anything")).await,
            Err(AuthError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_no_key_is_missing() {
        let verifier = ApiKeyVerifier::new(
            Arc::new(StaticKeys(ApiKeyVerification::invalid())),
            CapabilityKind::PublishDeploy,
        );
        assert!(matches!(
            verifier.verify(&Credentials::bearer("ryut_abc")).await,
            Err(AuthError::Missing)
        ));
    }

    #[tokio::test]
    async fn test_deploy_key_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        store
            .create_tenant(&Tenant {
                id: "t1".to_string(),
                name: "pack".to_string(),
                source_repository: None,
                public: false,
                created_at: Utc::now(),
            })
            .unwrap();

        let issued = KeyHasher::new().unwrap().issue_deploy_key().unwrap();
        let raw = issued.raw;
        store
            .create_deploy_key(&DeployKey {
                id: "k1".to_string(),
                tenant_id: "t1".to_string(),
                key_hash: issued.hash,
                key_lookup: issued.lookup,
                capability: CapabilityKind::PublishDeploy.as_str().to_string(),
                created_at: Utc::now(),
                last_used_at: None,
                revoked_at: None,
            })
            .unwrap();

        let store: Arc<dyn Store> = Arc::new(store);
        let keys = Arc::new(DeployKeyStore::new(store.clone(), Arc::new(SystemClock)).unwrap());
        let verifier = ApiKeyVerifier::new(keys.clone(), CapabilityKind::PublishDeploy);

        let principal = verifier.verify(&Credentials::bearer(raw.clone())).await.unwrap();
        assert_eq!(principal.tenant_id.as_deref(), Some("t1"));
        assert_eq!(principal.capability, CapabilityKind::PublishDeploy);
        assert_eq!(principal.subject_id, "k1");
        assert!(store.list_deploy_keys("t1").unwrap()[0].last_used_at.is_some());

        // Same body under another tag never reaches the hash check.
        let relabeled = raw.replacen(DEPLOY_KEY_PREFIX, RUNNER_TOKEN_PREFIX, 1);
        assert!(!keys.verify_key(&relabeled).unwrap().valid);

        store.revoke_deploy_key("k1", Utc::now()).unwrap();
        assert!(matches!(
            verifier.verify(&api_key(&raw)).await,
            Err(AuthError::Rejected(_))
        ));
    }
}
