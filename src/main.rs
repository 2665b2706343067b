use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use railyard::auth::{CapabilityKind, KeyHasher, RunnerTokenService, issue_user_token};
use railyard::clock::{Clock, SystemClock};
use railyard::config::ServerConfig;
use railyard::server::validation::validate_slug;
use railyard::server::{AppState, create_router};
use railyard::store::{SqliteStore, Store};
use railyard::types::{AccessLevel, DeployKey, GlobalRole, Membership, Role, Tenant, User};

#[derive(Parser)]
#[command(name = "railyard")]
#[command(about = "Publishing and distribution control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        /// Data directory holding the database
        #[arg(long, global = true, default_value = "./data", env = "RAILYARD_DATA_DIR")]
        data_dir: PathBuf,

        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(long, env = "RAILYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to
    #[arg(long, short)]
    port: Option<u16>,

    /// Data directory for the database and blob storage
    #[arg(long, env = "RAILYARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Public base URL for external access (e.g., "https://builds.example.com").
    /// Used for proxy storage URLs.
    #[arg(long)]
    public_base_url: Option<String>,

    /// Secret used to sign storage and runner access tokens
    #[arg(long, env = "RAILYARD_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database
    Init,

    /// Manage packs
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Inspect published builds
    Build {
        #[command(subcommand)]
        command: BuildCommands,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage pack memberships
    Member {
        #[command(subcommand)]
        command: MemberCommands,
    },

    /// Manage deploy keys
    DeployKey {
        #[command(subcommand)]
        command: DeployKeyCommands,
    },

    /// Issue user session tokens
    UserToken {
        #[command(subcommand)]
        command: UserTokenCommands,
    },

    /// Manage runner service tokens
    RunnerToken {
        #[command(subcommand)]
        command: RunnerTokenCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Create a pack
    Create {
        #[arg(long)]
        name: String,

        /// Repository allowed to publish with CI identity tokens (e.g., "acme/pack")
        #[arg(long)]
        source_repository: Option<String>,

        /// Serve the production channel without credentials
        #[arg(long)]
        public: bool,
    },

    /// Change a pack's publishing repository or visibility
    Update {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        source_repository: Option<String>,

        /// Drop the publishing repository
        #[arg(long, conflicts_with = "source_repository")]
        clear_source_repository: bool,

        #[arg(long)]
        public: Option<bool>,
    },

    /// List packs
    List,
}

#[derive(Subcommand)]
enum BuildCommands {
    /// List a pack's builds and where each channel points
    List {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Create {
        #[arg(long)]
        name: String,

        /// Grant global admin
        #[arg(long)]
        admin: bool,
    },
}

#[derive(Subcommand)]
enum MemberCommands {
    /// Add a user to a pack, or change their role
    Set {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,

        /// admin, member or player
        #[arg(long, default_value = "player")]
        role: String,

        /// all, dev, beta or production
        #[arg(long, default_value = "production")]
        access_level: String,
    },

    /// Remove a user from a pack
    Remove {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum DeployKeyCommands {
    /// Create a deploy key bound to a pack
    Create {
        #[arg(long)]
        tenant: String,
    },

    /// List a pack's deploy keys
    List {
        #[arg(long)]
        tenant: String,
    },

    /// Revoke a deploy key
    Revoke {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum UserTokenCommands {
    /// Issue a session token for a user
    Create {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "720")]
        ttl_hours: i64,
    },
}

#[derive(Subcommand)]
enum RunnerTokenCommands {
    /// Create a runner service token bound to a pack
    Create {
        #[arg(long)]
        tenant: String,

        /// Expire after this many days; never expires if omitted
        #[arg(long)]
        expires_in_days: Option<i64>,
    },

    /// List a pack's runner tokens
    List {
        #[arg(long)]
        tenant: String,
    },

    /// Revoke a runner token
    Revoke {
        #[arg(long)]
        id: String,
    },
}

fn print_secret(label: &str, secret: &str) {
    println!();
    println!("========================================");
    println!("{label} (save this, it won't be shown again):");
    println!();
    println!("  {secret}");
    println!();
    println!("========================================");
    println!();
}

fn open_store(data_dir: &std::path::Path) -> anyhow::Result<SqliteStore> {
    let db_path = data_dir.join("railyard.db");
    if !db_path.exists() {
        bail!("Database not found. Run 'railyard admin init' first.");
    }
    Ok(SqliteStore::new(db_path)?)
}

fn find_tenant(store: &dyn Store, key: &str) -> anyhow::Result<Tenant> {
    if let Some(tenant) = store.get_tenant(key)? {
        return Ok(tenant);
    }
    store
        .list_tenants()?
        .into_iter()
        .find(|t| t.name == key)
        .with_context(|| format!("Pack '{key}' not found"))
}

fn find_user(store: &dyn Store, key: &str) -> anyhow::Result<User> {
    if let Some(user) = store.get_user_by_name(key)? {
        return Ok(user);
    }
    store
        .get_user(key)?
        .with_context(|| format!("User '{key}' not found"))
}

fn run_init(data_dir: &std::path::Path) -> anyhow::Result<()> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join("railyard.db");
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;

    println!("Initialized database at {}", db_path.display());
    Ok(())
}

fn run_admin(data_dir: &std::path::Path, command: AdminCommands) -> anyhow::Result<()> {
    match command {
        AdminCommands::Init => run_init(data_dir),
        AdminCommands::Tenant { command } => run_tenant(&open_store(data_dir)?, command),
        AdminCommands::Build { command } => run_build(&open_store(data_dir)?, command),
        AdminCommands::User { command } => run_user(&open_store(data_dir)?, command),
        AdminCommands::Member { command } => run_member(&open_store(data_dir)?, command),
        AdminCommands::DeployKey { command } => run_deploy_key(&open_store(data_dir)?, command),
        AdminCommands::UserToken { command } => run_user_token(&open_store(data_dir)?, command),
        AdminCommands::RunnerToken { command } => {
            run_runner_token(Arc::new(open_store(data_dir)?), command)
        }
    }
}

fn run_tenant(store: &SqliteStore, command: TenantCommands) -> anyhow::Result<()> {
    match command {
        TenantCommands::Create {
            name,
            source_repository,
            public,
        } => {
            validate_slug(&name, "pack name")?;
            let tenant = Tenant {
                id: Uuid::new_v4().to_string(),
                name,
                source_repository,
                public,
                created_at: Utc::now(),
            };
            store.create_tenant(&tenant)?;
            println!("Created pack '{}' with id {}", tenant.name, tenant.id);
        }
        TenantCommands::Update {
            tenant,
            source_repository,
            clear_source_repository,
            public,
        } => {
            let mut tenant = find_tenant(store, &tenant)?;
            if clear_source_repository {
                tenant.source_repository = None;
            } else if source_repository.is_some() {
                tenant.source_repository = source_repository;
            }
            if let Some(public) = public {
                tenant.public = public;
            }
            store.update_tenant(&tenant)?;
            println!(
                "Updated pack '{}': repository {}, {}",
                tenant.name,
                tenant.source_repository.as_deref().unwrap_or("-"),
                if tenant.public { "public" } else { "private" }
            );
        }
        TenantCommands::List => {
            for tenant in store.list_tenants()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    tenant.id,
                    tenant.name,
                    tenant.source_repository.as_deref().unwrap_or("-"),
                    if tenant.public { "public" } else { "private" }
                );
            }
        }
    }
    Ok(())
}

fn run_build(store: &SqliteStore, command: BuildCommands) -> anyhow::Result<()> {
    match command {
        BuildCommands::List { tenant } => {
            let tenant = find_tenant(store, &tenant)?;
            let channels = store.list_channels(&tenant.id)?;
            for build in store.list_builds(&tenant.id)? {
                let on: Vec<&str> = channels
                    .iter()
                    .filter(|c| c.build_id.as_deref() == Some(build.id.as_str()))
                    .map(|c| c.name.as_str())
                    .collect();
                println!(
                    "{}\t{}\t{}\t{}{}",
                    build.id,
                    build.version,
                    build.created_at.to_rfc3339(),
                    if on.is_empty() { "-".to_string() } else { on.join(",") },
                    if build.force_reinstall { "\tforce-reinstall" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn run_user(store: &SqliteStore, command: UserCommands) -> anyhow::Result<()> {
    match command {
        UserCommands::Create { name, admin } => {
            validate_slug(&name, "user name")?;
            let user = User {
                id: Uuid::new_v4().to_string(),
                name,
                global_role: if admin { GlobalRole::Admin } else { GlobalRole::User },
                created_at: Utc::now(),
            };
            store.create_user(&user)?;
            println!("Created user '{}' with id {}", user.name, user.id);
        }
    }
    Ok(())
}

fn run_member(store: &SqliteStore, command: MemberCommands) -> anyhow::Result<()> {
    match command {
        MemberCommands::Set {
            tenant,
            user,
            role,
            access_level,
        } => {
            let tenant = find_tenant(store, &tenant)?;
            let user = find_user(store, &user)?;
            let role = Role::parse(&role)
                .with_context(|| format!("Unknown role '{role}' (admin, member, player)"))?;
            let access_level = AccessLevel::parse(&access_level).with_context(|| {
                format!("Unknown access level '{access_level}' (all, dev, beta, production)")
            })?;
            store.upsert_membership(&Membership {
                tenant_id: tenant.id,
                user_id: user.id,
                role,
                access_level,
            })?;
            println!(
                "Set '{}' in '{}' to {} / {}",
                user.name,
                tenant.name,
                role.as_str(),
                access_level.as_str()
            );
        }
        MemberCommands::Remove { tenant, user } => {
            let tenant = find_tenant(store, &tenant)?;
            let user = find_user(store, &user)?;
            if !store.delete_membership(&tenant.id, &user.id)? {
                bail!("'{}' is not a member of '{}'", user.name, tenant.name);
            }
            println!("Removed '{}' from '{}'", user.name, tenant.name);
        }
    }
    Ok(())
}

fn run_deploy_key(store: &SqliteStore, command: DeployKeyCommands) -> anyhow::Result<()> {
    match command {
        DeployKeyCommands::Create { tenant } => {
            let tenant = find_tenant(store, &tenant)?;
            let issued = KeyHasher::new()?.issue_deploy_key()?;
            let key = DeployKey {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant.id,
                key_hash: issued.hash,
                key_lookup: issued.lookup,
                capability: CapabilityKind::PublishDeploy.as_str().to_string(),
                created_at: Utc::now(),
                last_used_at: None,
                revoked_at: None,
            };
            store.create_deploy_key(&key)?;
            println!("Created deploy key {} for '{}'", key.id, tenant.name);
            print_secret("Deploy key", &issued.raw);
        }
        DeployKeyCommands::List { tenant } => {
            let tenant = find_tenant(store, &tenant)?;
            for key in store.list_deploy_keys(&tenant.id)? {
                let status = if key.revoked_at.is_some() { "revoked" } else { "active" };
                let last_used = key
                    .last_used_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{}\t{}\t{}\tlast used {}", key.id, key.capability, status, last_used);
            }
        }
        DeployKeyCommands::Revoke { id } => {
            if !store.revoke_deploy_key(&id, Utc::now())? {
                bail!("Deploy key '{id}' not found or already revoked");
            }
            println!("Revoked deploy key {id}");
        }
    }
    Ok(())
}

fn run_user_token(store: &SqliteStore, command: UserTokenCommands) -> anyhow::Result<()> {
    match command {
        UserTokenCommands::Create { user, ttl_hours } => {
            if ttl_hours <= 0 {
                bail!("--ttl-hours must be positive");
            }
            let user = find_user(store, &user)?;
            let (raw_token, record) =
                issue_user_token(store, &SystemClock, &user.id, Duration::hours(ttl_hours))?;
            println!(
                "Issued token for '{}' expiring {}",
                user.name,
                record.expires_at.to_rfc3339()
            );
            print_secret("User token", &raw_token);
        }
    }
    Ok(())
}

fn run_runner_token(store: Arc<dyn Store>, command: RunnerTokenCommands) -> anyhow::Result<()> {
    let service = RunnerTokenService::new(store.clone(), Arc::new(SystemClock));
    match command {
        RunnerTokenCommands::Create {
            tenant,
            expires_in_days,
        } => {
            let tenant = find_tenant(store.as_ref(), &tenant)?;
            let expires_at = expires_in_days.map(|days| Utc::now() + Duration::days(days));
            let (raw_token, record) = service.issue(&tenant.id, expires_at)?;
            println!("Created runner token {} for '{}'", record.id, tenant.name);
            print_secret("Runner token", &raw_token);
        }
        RunnerTokenCommands::List { tenant } => {
            let tenant = find_tenant(store.as_ref(), &tenant)?;
            for token in store.list_runner_tokens(&tenant.id)? {
                let status = if token.revoked_at.is_some() { "revoked" } else { "active" };
                let expires = token
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{}\t{}\t{}\texpires {}", token.id, token.token_prefix, status, expires);
            }
        }
        RunnerTokenCommands::Revoke { id } => {
            if !store.revoke_runner_token(&id, Utc::now())? {
                bail!("Runner token '{id}' not found or already revoked");
            }
            println!("Revoked runner token {id}");
        }
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.public_base_url.is_some() {
        config.public_base_url = args.public_base_url;
    }
    if args.signing_secret.is_some() {
        config.signing_secret = args.signing_secret;
    }

    let db_path = config.db_path();
    if !db_path.exists() {
        bail!("Server not initialized. Run 'railyard admin init' first to create the database.");
    }

    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let purged = store.delete_expired_user_tokens(clock.now())?;
    if purged > 0 {
        info!("Removed {purged} expired user tokens");
    }

    let state = Arc::new(AppState::new(&config, Arc::new(store), clock)?);
    let app = create_router(state);
    let addr = config.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("railyard=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { data_dir, command } => run_admin(&data_dir, command)?,
        Commands::Serve(args) => run_serve(args).await?,
    }

    Ok(())
}
