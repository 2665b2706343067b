use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccessLevel, ChannelName, GlobalRole, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Repository (`owner/name`) whose CI jobs may publish via federated identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repository: Option<String>,
    /// If true, anonymous clients may download the production build.
    pub public: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub global_role: GlobalRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub tenant_id: String,
    pub user_id: String,
    pub role: Role,
    pub access_level: AccessLevel,
}

/// Short-lived user session credential. Only the SHA-256 of the token is kept.
#[derive(Debug, Clone)]
pub struct UserToken {
    pub token_hash: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Long-lived publishing credential bound to one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployKey {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip)]
    pub key_hash: String,
    #[serde(skip)]
    pub key_lookup: String,
    /// Capability tag the key was minted for, e.g. `publish_deploy`.
    pub capability: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Revocable credential identifying an automated host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerToken {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip)]
    pub token_prefix: String,
    #[serde(skip)]
    pub salt: String,
    #[serde(skip)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: String,
    pub tenant_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    /// Encoded artifact reference, `<provider>::<key>` or a legacy bare key.
    pub artifact_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<i64>,
    #[serde(flatten)]
    pub metadata: BuildMetadata,
    pub force_reinstall: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub tenant_id: String,
    pub name: ChannelName,
    pub build_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
