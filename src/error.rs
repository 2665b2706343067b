use thiserror::Error;

use crate::storage::{CodecError, Provider, StorageError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage provider '{0}' is not enabled")]
    ProviderUnavailable(Provider),

    #[error("no storage provider is enabled")]
    NoProviderEnabled,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("no downloadable build")]
    NoDownloadableBuild,

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ProviderUnavailable(p) => Error::ProviderUnavailable(p),
            StorageError::NotFound => Error::NotFound("artifact not found".to_string()),
            StorageError::InvalidKey(msg) => Error::Validation(msg),
            StorageError::Upstream(msg) => Error::Upstream(msg),
            StorageError::Io(e) => Error::Io(e),
            StorageError::Signing(msg) => Error::Internal(msg),
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Empty => Error::Validation(e.to_string()),
            CodecError::NoProviderEnabled => Error::NoProviderEnabled,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
