use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

use railyard::auth::{CapabilityKind, KeyHasher, RunnerTokenService, issue_user_token};
use railyard::clock::{Clock, ManualClock};
use railyard::config::{BlobConfig, OidcConfig, RateLimitConfig, ServerConfig, StorageConfig};
use railyard::server::{AppState, create_router};
use railyard::store::{SqliteStore, Store};
use railyard::types::{AccessLevel, DeployKey, GlobalRole, Membership, Role, Tenant, User};

pub const SIGNING_SECRET: &str = "test-signing-secret-with-enough-bytes";
pub const START_EPOCH: i64 = 1_700_000_000;

pub struct TestOptions {
    pub oidc: Option<OidcConfig>,
    pub rate_limit: RateLimitConfig,
    pub trust_forwarded_for: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            oidc: None,
            rate_limit: RateLimitConfig {
                requests: 1_000,
                window_secs: 60,
                max_tracked_keys: 1_000,
            },
            trust_forwarded_for: false,
        }
    }
}

/// A server running in this process on an ephemeral port, backed by a temp
/// directory and a clock the test controls.
pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub store: Arc<dyn Store>,
    pub clock: Arc<ManualClock>,
    pub client: reqwest::Client,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestOptions::default()).await
    }

    pub async fn start_with(options: TestOptions) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let data_dir = temp_dir.path().to_path_buf();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let base_url = format!("http://127.0.0.1:{port}");

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            data_dir: data_dir.clone(),
            signing_secret: Some(SIGNING_SECRET.to_string()),
            oidc: options.oidc,
            storage: StorageConfig {
                blob: Some(BlobConfig {
                    directory: data_dir.join("blobs"),
                }),
                ..StorageConfig::default()
            },
            rate_limit: options.rate_limit,
            trust_forwarded_for: options.trust_forwarded_for,
            ..ServerConfig::default()
        };

        let store = SqliteStore::new(config.db_path()).expect("open store");
        store.initialize().expect("initialize store");
        let store: Arc<dyn Store> = Arc::new(store);

        let clock = Arc::new(ManualClock::at_epoch(START_EPOCH));
        let state = AppState::new(&config, store.clone(), clock.clone()).expect("build state");
        let app = create_router(Arc::new(state));

        let handle = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        let server = Self {
            temp_dir,
            base_url,
            store,
            clock,
            client: reqwest::Client::new(),
            handle,
        };
        server.wait_for_ready().await;
        server
    }

    async fn wait_for_ready(&self) {
        for _ in 0..50 {
            if self.client.get(self.url("/health")).send().await.is_ok() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("Server did not become ready");
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn create_tenant(&self, name: &str, source_repository: Option<&str>, public: bool) -> Tenant {
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_repository: source_repository.map(str::to_string),
            public,
            created_at: self.clock.now(),
        };
        self.store.create_tenant(&tenant).expect("create tenant");
        tenant
    }

    pub fn create_user(&self, name: &str, global_role: GlobalRole) -> User {
        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            global_role,
            created_at: self.clock.now(),
        };
        self.store.create_user(&user).expect("create user");
        user
    }

    pub fn add_member(&self, tenant: &Tenant, user: &User, role: Role, access_level: AccessLevel) {
        self.store
            .upsert_membership(&Membership {
                tenant_id: tenant.id.clone(),
                user_id: user.id.clone(),
                role,
                access_level,
            })
            .expect("add member");
    }

    /// Creates a user with a membership and returns a session token for them.
    pub fn member_token(&self, tenant: &Tenant, name: &str, role: Role, access_level: AccessLevel) -> String {
        let user = self.create_user(name, GlobalRole::User);
        self.add_member(tenant, &user, role, access_level);
        self.user_token(&user)
    }

    pub fn user_token(&self, user: &User) -> String {
        let (raw, _) = issue_user_token(
            self.store.as_ref(),
            self.clock.as_ref(),
            &user.id,
            Duration::hours(24),
        )
        .expect("issue user token");
        raw
    }

    pub fn deploy_key(&self, tenant: &Tenant) -> String {
        let issued = KeyHasher::new()
            .and_then(|hasher| hasher.issue_deploy_key())
            .expect("issue deploy key");
        self.store
            .create_deploy_key(&DeployKey {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant.id.clone(),
                key_hash: issued.hash,
                key_lookup: issued.lookup,
                capability: CapabilityKind::PublishDeploy.as_str().to_string(),
                created_at: Utc::now(),
                last_used_at: None,
                revoked_at: None,
            })
            .expect("create deploy key");
        issued.raw
    }

    pub fn runner_token(&self, tenant: &Tenant) -> String {
        let service = RunnerTokenService::new(self.store.clone(), self.clock.clone());
        let (raw, _) = service.issue(&tenant.id, None).expect("issue runner token");
        raw
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
