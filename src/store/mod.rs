mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// Store defines the database interface.
///
/// Build and channel rows are written only through the registry; every other
/// component reads them.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Tenant operations
    fn create_tenant(&self, tenant: &Tenant) -> Result<()>;
    fn get_tenant(&self, id: &str) -> Result<Option<Tenant>>;
    fn list_tenants(&self) -> Result<Vec<Tenant>>;
    fn update_tenant(&self, tenant: &Tenant) -> Result<()>;

    // User operations
    fn create_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_name(&self, name: &str) -> Result<Option<User>>;

    // Membership operations
    fn upsert_membership(&self, membership: &Membership) -> Result<()>;
    fn get_membership(&self, tenant_id: &str, user_id: &str) -> Result<Option<Membership>>;
    fn delete_membership(&self, tenant_id: &str, user_id: &str) -> Result<bool>;

    // User token operations
    fn create_user_token(&self, token: &UserToken) -> Result<()>;
    fn get_user_token(&self, token_hash: &str) -> Result<Option<UserToken>>;
    fn delete_expired_user_tokens(&self, now: DateTime<Utc>) -> Result<usize>;

    // Deploy key operations
    fn create_deploy_key(&self, key: &DeployKey) -> Result<()>;
    fn get_deploy_key_by_lookup(&self, lookup: &str) -> Result<Option<DeployKey>>;
    fn list_deploy_keys(&self, tenant_id: &str) -> Result<Vec<DeployKey>>;
    fn revoke_deploy_key(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;
    fn update_deploy_key_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    // Runner token operations
    fn create_runner_token(&self, token: &RunnerToken) -> Result<()>;
    /// Every record sharing `prefix`, revoked and expired ones included.
    fn list_runner_tokens_by_prefix(&self, prefix: &str) -> Result<Vec<RunnerToken>>;
    fn list_runner_tokens(&self, tenant_id: &str) -> Result<Vec<RunnerToken>>;
    fn revoke_runner_token(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    // Build operations
    fn get_build(&self, id: &str) -> Result<Option<Build>>;
    fn list_builds(&self, tenant_id: &str) -> Result<Vec<Build>>;
    fn set_build_force_reinstall(&self, tenant_id: &str, id: &str, flag: bool) -> Result<bool>;
    /// True if any build of the tenant with `after < created_at <= up_to` is flagged.
    fn has_force_reinstall_between(
        &self,
        tenant_id: &str,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<bool>;

    // Channel operations
    fn get_channel(&self, tenant_id: &str, name: ChannelName) -> Result<Option<Channel>>;
    fn list_channels(&self, tenant_id: &str) -> Result<Vec<Channel>>;
    fn upsert_channel(&self, channel: &Channel) -> Result<()>;

    /// Upserts `build` keyed by id and optionally points `channel` at it, in
    /// one transaction. An existing row keeps its original `created_at`.
    /// Returns the stored build.
    fn publish_build(&self, build: &Build, channel: Option<&Channel>) -> Result<Build>;
}
