use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::Published;
use crate::resolution::Resolved;
use crate::storage::{AccessDescriptor, ClientUploadGrant, Provider};
use crate::types::{Build, BuildMetadata, Channel, ChannelName};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    #[serde(default)]
    pub pack_id: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub build_id: String,
    pub artifact_key: String,
    pub artifact_provider: Provider,
    pub upload_url: String,
    pub upload_method: &'static str,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    #[serde(default)]
    pub pack_id: Option<String>,
    pub build_id: String,
    pub artifact_key: String,
    pub version: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub artifact_size: Option<i64>,
    /// Required. The handler reports absence as a validation error.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(flatten)]
    pub metadata: BuildMetadata,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub build: Build,
    pub channel: Option<Channel>,
}

impl From<Published> for PublishResponse {
    fn from(published: Published) -> Self {
        Self {
            build: published.build,
            channel: published.channel,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveParams {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub current_build_id: Option<String>,
}

/// What a client needs to fetch and install one build.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedBuild {
    pub channel: ChannelName,
    pub build_id: String,
    pub build_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub artifact_key: String,
    pub artifact_provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<i64>,
    pub download_url: String,
    pub download_expires_at: DateTime<Utc>,
    pub force_reinstall: bool,
    pub requires_full_reinstall: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: BuildMetadata,
}

impl ResolvedBuild {
    #[must_use]
    pub fn new(resolved: Resolved, download: AccessDescriptor, requires_full_reinstall: bool) -> Self {
        let Resolved {
            channel,
            build,
            artifact,
        } = resolved;
        Self {
            channel,
            build_id: build.id,
            build_version: build.version,
            commit_hash: build.commit_hash,
            artifact_key: build.artifact_key,
            artifact_provider: artifact.provider,
            artifact_size: build.artifact_size,
            download_url: download.url,
            download_expires_at: download.expires_at,
            force_reinstall: build.force_reinstall,
            requires_full_reinstall,
            created_at: build.created_at,
            metadata: build.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest {
    pub build_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceReinstallRequest {
    pub force_reinstall: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTokenRequest {
    pub pathname: String,
    pub content_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTokenResponse {
    #[serde(flatten)]
    pub grant: ClientUploadGrant,
    /// Value to pass as `artifactKey` when publishing the uploaded file.
    pub artifact_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerTokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub struct StorageTokenQuery {
    pub token: String,
}
