//! Authoritative record of builds and the channel pointers that select them.
//!
//! Nothing else in the crate writes builds or channels.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::{ArtifactRef, EnabledProviders, decode, encode};
use crate::store::Store;
use crate::types::{Build, BuildMetadata, Channel, ChannelName};

/// One publish call from CI.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub build_id: String,
    pub version: String,
    pub commit_hash: Option<String>,
    pub artifact_key: String,
    pub artifact_size: Option<i64>,
    pub metadata: BuildMetadata,
    pub channel: Option<ChannelName>,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub build: Build,
    pub channel: Option<Channel>,
}

pub struct Registry {
    store: Arc<dyn Store>,
    enabled: EnabledProviders,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, enabled: EnabledProviders, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            enabled,
            clock,
        }
    }

    /// Decodes a stored artifact key and requires its provider to be enabled.
    pub fn artifact(&self, stored: &str) -> Result<ArtifactRef> {
        let reference = decode(stored, &self.enabled)?;
        if !self.enabled.contains(reference.provider) {
            return Err(Error::ProviderUnavailable(reference.provider));
        }
        Ok(reference)
    }

    /// Idempotent upsert keyed by build id. A retry with the same id refreshes
    /// version, commit, artifact, size and metadata; ownership never changes.
    pub fn publish_build(&self, tenant_id: &str, request: PublishRequest) -> Result<Published> {
        if request.build_id.trim().is_empty() {
            return Err(Error::Validation("buildId is required".to_string()));
        }
        if request.version.trim().is_empty() {
            return Err(Error::Validation("version is required".to_string()));
        }

        // Legacy bare keys are stored in the explicit form from here on.
        let reference = self.artifact(&request.artifact_key)?;

        let now = self.clock.now();
        let build = Build {
            id: request.build_id,
            tenant_id: tenant_id.to_string(),
            version: request.version,
            commit_hash: request.commit_hash,
            artifact_key: encode(&reference),
            artifact_size: request.artifact_size,
            metadata: request.metadata,
            force_reinstall: false,
            created_at: now,
        };
        let channel = request.channel.map(|name| Channel {
            tenant_id: tenant_id.to_string(),
            name,
            build_id: Some(build.id.clone()),
            updated_at: now,
        });

        let build = self.store.publish_build(&build, channel.as_ref())?;
        tracing::info!(
            tenant = tenant_id,
            build = %build.id,
            version = %build.version,
            channel = channel.as_ref().map(|c| c.name.as_str()),
            "published build"
        );

        Ok(Published { build, channel })
    }

    /// A build of `tenant_id`. Builds of other tenants read as absent.
    pub fn build(&self, tenant_id: &str, build_id: &str) -> Result<Build> {
        self.store
            .get_build(build_id)?
            .filter(|b| b.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("build '{build_id}' not found")))
    }

    /// Points `channel` at `build_id`. Last write wins.
    pub fn promote(&self, tenant_id: &str, channel: ChannelName, build_id: &str) -> Result<Channel> {
        let build = self.build(tenant_id, build_id)?;
        self.artifact(&build.artifact_key)?;

        let pointer = Channel {
            tenant_id: tenant_id.to_string(),
            name: channel,
            build_id: Some(build.id),
            updated_at: self.clock.now(),
        };
        self.store.upsert_channel(&pointer)?;

        tracing::info!(tenant = tenant_id, %channel, build = build_id, "promoted build");
        Ok(pointer)
    }

    pub fn set_force_reinstall(&self, tenant_id: &str, build_id: &str, flag: bool) -> Result<Build> {
        if !self.store.set_build_force_reinstall(tenant_id, build_id, flag)? {
            return Err(Error::NotFound(format!("build '{build_id}' not found")));
        }
        self.build(tenant_id, build_id)
    }

    pub fn channels(&self, tenant_id: &str) -> Result<Vec<Channel>> {
        self.store.list_channels(tenant_id)
    }

    /// True iff the installed build is strictly older than the target and some
    /// build created after it, up to and including the target, is flagged.
    /// An installed build the registry does not know (deleted, or from another
    /// tenant) is not older than anything.
    pub fn compute_requires_full_reinstall(
        &self,
        tenant_id: &str,
        target: &Build,
        current_build_id: Option<&str>,
    ) -> Result<bool> {
        let Some(current_id) = current_build_id.filter(|id| !id.is_empty()) else {
            return Ok(false);
        };
        if current_id == target.id {
            return Ok(false);
        }

        let Some(current) = self
            .store
            .get_build(current_id)?
            .filter(|b| b.tenant_id == tenant_id)
        else {
            return Ok(false);
        };

        if current.created_at >= target.created_at {
            return Ok(false);
        }

        self.store
            .has_force_reinstall_between(tenant_id, current.created_at, target.created_at)
    }
}
