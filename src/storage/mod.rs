//! Storage backends and artifact references.
//!
//! Callers never branch on provider names: they decode an [`ArtifactRef`] and
//! ask the [`StorageRegistry`] for the backend registered under its provider.

mod blob;
mod presign;
mod reference;
mod token;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use blob::{
    CLIENT_UPLOAD_TTL_SECS, ClientUploadGrant, DOWNLOAD_ROUTE, LocalBlobStore,
    PROXY_TOKEN_TTL_SECS, ProxyBackend, UPLOAD_ROUTE,
};
pub use presign::{AddressingStyle, ObjectStoreBackend, PRESIGN_TTL_SECS, SigV4Presigner};
pub use reference::{ArtifactRef, CodecError, EnabledProviders, Provider, decode, encode};
pub use token::{StorageAction, StorageToken, StorageTokenError, StorageTokenSigner};

use crate::clock::Clock;
use crate::config::StorageConfig;

const MAX_KEY_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage provider '{0}' is not enabled")]
    ProviderUnavailable(Provider),
    #[error("object not found")]
    NotFound,
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("upstream storage error: {0}")]
    Upstream(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            Self::NotFound
        } else {
            Self::Io(e)
        }
    }
}

/// Time-limited, provider-correct instructions for moving one object.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDescriptor {
    pub provider: Provider,
    pub method: &'static str,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: Option<i64>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn provider(&self) -> Provider;

    fn upload_access(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<AccessDescriptor, StorageError>;

    fn download_access(&self, key: &str) -> Result<AccessDescriptor, StorageError>;

    /// Existence check. `Ok(None)` means the object is definitely absent.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError>;
}

/// Rejects keys that could escape a storage root or confuse URL building.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "key cannot exceed {MAX_KEY_LEN} characters"
        )));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(
            "key must be a relative forward-slash path".to_string(),
        ));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(
            "key cannot contain empty, '.' or '..' segments".to_string(),
        ));
    }
    Ok(())
}

/// Enabled backends keyed by provider. Built once at startup.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: HashMap<Provider, Arc<dyn StorageBackend>>,
    proxy: Option<Arc<ProxyBackend>>,
    enabled: EnabledProviders,
}

impl StorageRegistry {
    /// Builds every backend whose configuration is complete.
    pub fn from_config(
        config: &StorageConfig,
        signer: StorageTokenSigner,
        public_base_url: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let object_store = match config.object_store.as_ref().filter(|c| c.is_complete()) {
            Some(c) => Some(Arc::new(ObjectStoreBackend::new(c, clock.clone())?)),
            None => None,
        };

        let proxy = config.blob.as_ref().map(|c| {
            Arc::new(ProxyBackend::new(
                LocalBlobStore::new(&c.directory),
                signer,
                public_base_url,
                clock.clone(),
            ))
        });

        Ok(Self::new(object_store, proxy, config.preferred))
    }

    pub fn new(
        object_store: Option<Arc<ObjectStoreBackend>>,
        proxy: Option<Arc<ProxyBackend>>,
        preferred: Option<Provider>,
    ) -> Self {
        let mut backends: HashMap<Provider, Arc<dyn StorageBackend>> = HashMap::new();
        if let Some(b) = object_store {
            backends.insert(Provider::ObjectStore, b);
        }
        if let Some(b) = &proxy {
            backends.insert(Provider::Blob, b.clone());
        }

        let enabled = EnabledProviders::new(backends.keys().copied(), preferred);
        Self {
            backends,
            proxy,
            enabled,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> &EnabledProviders {
        &self.enabled
    }

    pub fn backend(&self, provider: Provider) -> Result<&dyn StorageBackend, StorageError> {
        self.backends
            .get(&provider)
            .map(|b| b.as_ref())
            .ok_or(StorageError::ProviderUnavailable(provider))
    }

    /// Backend new uploads should go to.
    pub fn preferred(&self) -> Option<&dyn StorageBackend> {
        self.enabled
            .preferred()
            .and_then(|p| self.backends.get(&p))
            .map(|b| b.as_ref())
    }

    /// The proxy backend, when blob storage is enabled.
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyBackend> {
        self.proxy.as_deref()
    }

    pub fn decode(&self, stored: &str) -> Result<ArtifactRef, CodecError> {
        decode(stored, &self.enabled)
    }

    pub fn download_access(&self, reference: &ArtifactRef) -> Result<AccessDescriptor, StorageError> {
        self.backend(reference.provider)?
            .download_access(&reference.key)
    }

    pub fn upload_access(
        &self,
        reference: &ArtifactRef,
        content_type: Option<&str>,
    ) -> Result<AccessDescriptor, StorageError> {
        self.backend(reference.provider)?
            .upload_access(&reference.key, content_type)
    }

    pub async fn head(&self, reference: &ArtifactRef) -> Result<Option<ObjectInfo>, StorageError> {
        self.backend(reference.provider)?.head(&reference.key).await
    }
}
