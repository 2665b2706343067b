mod server;

pub use server::{
    BlobConfig, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_RUNNER_TOKEN_TTL_SECS, ObjectStoreConfig,
    OidcConfig, RateLimitConfig, ServerConfig, StorageConfig,
};
