use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage::{AddressingStyle, Provider};

pub const DEFAULT_RUNNER_TOKEN_TTL_SECS: u64 = 3600;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const MIN_SIGNING_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Public base URL for external access (e.g., "https://builds.example.com").
    /// Used for proxy storage URLs. Defaults to `http://host:port`.
    pub public_base_url: Option<String>,
    /// HMAC secret for storage tokens and runner access tokens.
    pub signing_secret: Option<String>,
    pub runner_token_ttl_secs: u64,
    pub max_upload_bytes: usize,
    /// Key rate limits on the first `X-Forwarded-For` hop instead of the
    /// socket peer. Only enable behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    pub oidc: Option<OidcConfig>,
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    /// Reads a TOML config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("railyard.db")
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .signing_secret
            .as_ref()
            .is_some_and(|s| s.len() < MIN_SIGNING_SECRET_LEN)
        {
            return Err(Error::Config(format!(
                "signing_secret must be at least {MIN_SIGNING_SECRET_LEN} bytes"
            )));
        }
        if self.runner_token_ttl_secs == 0 {
            return Err(Error::Config("runner_token_ttl_secs must be positive".to_string()));
        }
        if self
            .oidc
            .as_ref()
            .is_some_and(|o| o.issuer.is_empty() || o.audience.is_empty())
        {
            return Err(Error::Config("oidc issuer and audience are required".to_string()));
        }
        if self.rate_limit.requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(Error::Config(
                "rate_limit requests and window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            public_base_url: None,
            signing_secret: None,
            runner_token_ttl_secs: DEFAULT_RUNNER_TOKEN_TTL_SECS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            trust_forwarded_for: false,
            oidc: None,
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Federated CI identity settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: String,
    /// Defaults to `<issuer>/.well-known/jwks`.
    #[serde(default)]
    pub jwks_url: Option<String>,
}

impl OidcConfig {
    #[must_use]
    pub fn jwks_url(&self) -> String {
        self.jwks_url.clone().unwrap_or_else(|| {
            format!("{}/.well-known/jwks", self.issuer.trim_end_matches('/'))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Provider for new uploads when more than one is enabled.
    pub preferred: Option<Provider>,
    pub object_store: Option<ObjectStoreConfig>,
    pub blob: Option<BlobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub addressing: AddressingStyle,
}

impl ObjectStoreConfig {
    /// Enabled only when every credential is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        [
            &self.endpoint,
            &self.bucket,
            &self.region,
            &self.access_key_id,
            &self.secret_access_key,
        ]
        .iter()
        .all(|v| !v.trim().is_empty())
    }
}

fn default_region() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests allowed per identity per window.
    pub requests: u32,
    pub window_secs: u64,
    /// Expired windows are swept once this many identities are tracked.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 60,
            window_secs: 60,
            max_tracked_keys: 10_000,
        }
    }
}
