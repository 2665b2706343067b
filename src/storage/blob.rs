use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use uuid::Uuid;

use super::token::{StorageAction, StorageToken, StorageTokenError, StorageTokenSigner};
use super::{AccessDescriptor, ObjectInfo, Provider, StorageBackend, StorageError, validate_key};
use crate::clock::Clock;

/// Proxy download/upload tokens live this long.
pub const PROXY_TOKEN_TTL_SECS: i64 = 900;
/// Delegated client-side upload tokens live this long.
pub const CLIENT_UPLOAD_TTL_SECS: i64 = 300;

pub const DOWNLOAD_ROUTE: &str = "/internal/storage/download";
pub const UPLOAD_ROUTE: &str = "/internal/storage/upload";

/// Filesystem blob store behind the proxy routes.
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_path.join("objects").join(key))
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path.join("tmp").join(Uuid::new_v4().to_string())
    }

    pub async fn size(&self, key: &str) -> Result<i64, StorageError> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(StorageError::from_io)?;
        Ok(metadata.len() as i64)
    }

    pub async fn get(&self, key: &str) -> Result<(BufReader<File>, i64), StorageError> {
        let path = self.object_path(key)?;
        let file = File::open(&path).await.map_err(StorageError::from_io)?;

        let metadata = file.metadata().await?;
        let size = metadata.len() as i64;

        Ok((BufReader::new(file), size))
    }

    /// Writes through a temp file and renames so readers never see a partial
    /// object. A failed write leaves nothing behind in `tmp/`.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let final_path = self.object_path(key)?;

        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = write_then_rename(&temp_path, &final_path, data).await;
        if written.is_err() {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %temp_path.display(), "temp blob not removed: {cleanup}");
                }
            }
        }
        written
    }
}

async fn write_then_rename(temp_path: &Path, final_path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut temp_file = File::create(temp_path).await?;
    temp_file.write_all(data).await?;
    temp_file.sync_all().await?;
    drop(temp_file);

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(temp_path, final_path).await?;
    Ok(())
}

/// Client-side upload grant: one pathname, one content type.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUploadGrant {
    pub token: String,
    pub upload_url: String,
    pub pathname: String,
    pub content_type: String,
    pub expires_at: DateTime<Utc>,
}

/// Proxy-token backend: mints [`StorageToken`]s pointing at the internal
/// storage routes, which stream objects through the server.
pub struct ProxyBackend {
    store: LocalBlobStore,
    signer: StorageTokenSigner,
    public_base_url: String,
    clock: Arc<dyn Clock>,
}

impl ProxyBackend {
    pub fn new(
        store: LocalBlobStore,
        signer: StorageTokenSigner,
        public_base_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            signer,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            clock,
        }
    }

    #[must_use]
    pub fn store(&self) -> &LocalBlobStore {
        &self.store
    }

    fn mint(
        &self,
        action: StorageAction,
        key: &str,
        content_type: Option<&str>,
        ttl_secs: i64,
    ) -> Result<(String, DateTime<Utc>), StorageError> {
        validate_key(key)?;
        let expires_at = self.clock.now() + Duration::seconds(ttl_secs);
        let token = StorageToken {
            action,
            provider: Provider::Blob,
            key: key.to_string(),
            expires_at: expires_at.timestamp(),
            content_type: content_type.map(str::to_string),
        };
        Ok((self.signer.sign(&token), expires_at))
    }

    fn route_url(&self, route: &str, token: &str) -> String {
        format!(
            "{}{route}?token={}",
            self.public_base_url,
            urlencoding::encode(token)
        )
    }

    /// Issues a short-lived upload grant bound to exactly `pathname` and
    /// `content_type`, so large uploads never need a publisher credential on
    /// the wire.
    pub fn client_upload(
        &self,
        pathname: &str,
        content_type: &str,
    ) -> Result<ClientUploadGrant, StorageError> {
        if content_type.trim().is_empty() {
            return Err(StorageError::InvalidKey("content type is required".to_string()));
        }
        let (token, expires_at) = self.mint(
            StorageAction::Upload,
            pathname,
            Some(content_type),
            CLIENT_UPLOAD_TTL_SECS,
        )?;
        Ok(ClientUploadGrant {
            upload_url: self.route_url(UPLOAD_ROUTE, &token),
            token,
            pathname: pathname.to_string(),
            content_type: content_type.to_string(),
            expires_at,
        })
    }

    /// Validates a token presented to an internal route.
    pub fn verify(&self, raw: &str, action: StorageAction) -> Result<StorageToken, StorageTokenError> {
        let token = self.signer.verify(raw, action, self.clock.now())?;
        if token.provider != Provider::Blob {
            return Err(StorageTokenError::Malformed);
        }
        Ok(token)
    }
}

#[async_trait]
impl StorageBackend for ProxyBackend {
    fn provider(&self) -> Provider {
        Provider::Blob
    }

    fn upload_access(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<AccessDescriptor, StorageError> {
        let (token, expires_at) =
            self.mint(StorageAction::Upload, key, content_type, PROXY_TOKEN_TTL_SECS)?;
        Ok(AccessDescriptor {
            provider: Provider::Blob,
            method: "PUT",
            url: self.route_url(UPLOAD_ROUTE, &token),
            expires_at,
        })
    }

    fn download_access(&self, key: &str) -> Result<AccessDescriptor, StorageError> {
        let (token, expires_at) =
            self.mint(StorageAction::Download, key, None, PROXY_TOKEN_TTL_SECS)?;
        Ok(AccessDescriptor {
            provider: Provider::Blob,
            method: "GET",
            url: self.route_url(DOWNLOAD_ROUTE, &token),
            expires_at,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        match self.store.size(key).await {
            Ok(size) => Ok(Some(ObjectInfo { size: Some(size) })),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
