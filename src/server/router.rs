use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Router, routing::get};
use rand::RngCore;

use super::api::api_router;
use super::internal::internal_router;
use crate::auth::{
    ApiKeyVerifier, CapabilityKind, CredentialResolver, DeployKeyStore, HttpJwksSource, JwksCache,
    OidcCredentialVerifier, OidcVerifier, RunnerAccessTokens, RunnerAccessVerifier,
    RunnerTokenService, UserTokenVerifier, derive_secret,
};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::storage::{Provider, StorageRegistry, StorageTokenSigner};
use crate::store::Store;

const STORAGE_TOKEN_KEY_LABEL: &str = "storage-token";
const RUNNER_ACCESS_KEY_LABEL: &str = "runner-access";

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub storage: StorageRegistry,
    pub registry: Registry,
    pub resolver: CredentialResolver,
    pub runner_tokens: RunnerTokenService,
    pub runner_access: Arc<RunnerAccessTokens>,
    pub rate_limiter: RateLimiter,
    pub max_upload_bytes: usize,
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// Wires every component from configuration. Provider enablement is
    /// decided here, once.
    pub fn new(config: &ServerConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let master = match &config.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "No signing secret configured; using a random one. Issued tokens will not survive a restart."
                );
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        let signer = StorageTokenSigner::new(derive_secret(&master, STORAGE_TOKEN_KEY_LABEL));
        let storage =
            StorageRegistry::from_config(&config.storage, signer, &config.base_url(), clock.clone())?;
        if storage.enabled().is_empty() {
            tracing::warn!("No storage provider is configured; publishing and downloads will fail");
        }

        let runner_access = Arc::new(RunnerAccessTokens::new(
            &derive_secret(&master, RUNNER_ACCESS_KEY_LABEL),
            config.runner_token_ttl_secs,
            clock.clone(),
        ));

        let mut resolver = CredentialResolver::new();
        if let Some(oidc) = &config.oidc {
            let source = HttpJwksSource::new(oidc.jwks_url()).map_err(|e| Error::Config(e.to_string()))?;
            let keys = Arc::new(JwksCache::new(Arc::new(source), clock.clone()));
            let verifier = OidcVerifier::new(&oidc.issuer, &oidc.audience, keys, clock.clone());
            resolver = resolver.with(OidcCredentialVerifier::new(Arc::new(verifier)));
        }
        let resolver = resolver
            .with(ApiKeyVerifier::new(
                Arc::new(DeployKeyStore::new(store.clone(), clock.clone())?),
                CapabilityKind::PublishDeploy,
            ))
            .with(UserTokenVerifier::new(store.clone(), clock.clone()))
            .with(RunnerAccessVerifier::new(runner_access.clone()));

        tracing::info!(
            verifiers = ?resolver.names(),
            providers = ?storage.enabled().iter().map(Provider::as_str).collect::<Vec<_>>(),
            "initialized control plane"
        );

        Ok(Self {
            registry: Registry::new(store.clone(), storage.enabled().clone(), clock.clone()),
            runner_tokens: RunnerTokenService::new(store.clone(), clock.clone()),
            rate_limiter: RateLimiter::new(&config.rate_limit, clock.clone()),
            max_upload_bytes: config.max_upload_bytes,
            trust_forwarded_for: config.trust_forwarded_for,
            store,
            clock,
            storage,
            resolver,
            runner_access,
        })
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_router())
        .merge(internal_router(state.max_upload_bytes))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
