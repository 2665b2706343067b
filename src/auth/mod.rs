//! Authentication: who is calling. Authorization lives with the handlers.

mod api_key;
mod middleware;
mod oidc;
mod principal;
mod resolver;
mod runner;
mod session;
mod token;

pub use api_key::{ApiKeyMetadata, ApiKeyStore, ApiKeyVerification, ApiKeyVerifier, DeployKeyStore};
pub use middleware::Authenticated;
pub use oidc::{
    Audience, CLOCK_SKEW_SECS, HttpJwksSource, JWKS_CACHE_TTL_SECS, JWKS_MIN_REFRESH_SECS,
    JwksCache, JwksSource, OidcClaims, OidcCredentialVerifier, OidcError, OidcVerifier,
};
pub use principal::{CapabilityKind, OidcIdentity, Principal};
pub use resolver::{
    API_KEY_HEADER, AuthError, CredentialResolver, CredentialVerifier, Credentials,
    OIDC_TOKEN_HEADER,
};
pub use runner::{
    ACCESS_TOKEN_AUDIENCE, ACCESS_TOKEN_ISSUER, RunnerAccessClaims, RunnerAccessTokens, RunnerAccessVerifier, RunnerTokenService,
};
pub use session::{UserTokenVerifier, hash_user_token, issue_user_token};
pub use token::{
    DEPLOY_KEY_PREFIX, IssuedDeployKey, KeyHasher, LOOKUP_PREFIX_LEN, RUNNER_TOKEN_PREFIX,
    TokenKind, USER_TOKEN_PREFIX, derive_secret,
};
