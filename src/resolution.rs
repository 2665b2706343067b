//! Which build a reading client should run.

use crate::error::{Error, Result};
use crate::storage::{ArtifactRef, EnabledProviders, decode};
use crate::store::Store;
use crate::types::{AccessLevel, Build, ChannelName, Role};

/// Channels a requester may read, derived from their membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Always in declaration order.
    pub allowed: Vec<ChannelName>,
    pub preferred: ChannelName,
}

impl AccessGrant {
    #[must_use]
    pub fn compute(level: AccessLevel, role: Role) -> Self {
        let allowed = if role == Role::Admin || level == AccessLevel::All {
            ChannelName::ALL.to_vec()
        } else {
            match level {
                AccessLevel::Dev => vec![ChannelName::Dev, ChannelName::Production],
                AccessLevel::Beta => vec![ChannelName::Beta, ChannelName::Production],
                _ => vec![ChannelName::Production],
            }
        };

        let preferred = match level {
            AccessLevel::Dev => ChannelName::Dev,
            AccessLevel::Beta => ChannelName::Beta,
            _ => ChannelName::Production,
        };

        Self { allowed, preferred }
    }

    /// Production only, for anonymous readers of public tenants.
    #[must_use]
    pub fn public() -> Self {
        Self::compute(AccessLevel::Production, Role::Player)
    }

    #[must_use]
    pub fn allows(&self, channel: ChannelName) -> bool {
        self.allowed.contains(&channel)
    }

    /// Explicit request if allowed, then the preferred channel, then every
    /// other allowed channel; first occurrence wins.
    #[must_use]
    pub fn candidate_order(&self, requested: Option<ChannelName>) -> Vec<ChannelName> {
        let head = requested
            .filter(|c| self.allows(*c))
            .into_iter()
            .chain([self.preferred]);

        let mut order: Vec<ChannelName> = Vec::with_capacity(self.allowed.len());
        for channel in head.chain(self.allowed.iter().copied()) {
            if self.allows(channel) && !order.contains(&channel) {
                order.push(channel);
            }
        }
        order
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub channel: ChannelName,
    pub build: Build,
    pub artifact: ArtifactRef,
}

/// Walks the candidate order and returns the first channel whose build exists
/// and whose artifact decodes to an enabled provider.
pub fn resolve(
    store: &dyn Store,
    enabled: &EnabledProviders,
    tenant_id: &str,
    grant: &AccessGrant,
    requested: Option<ChannelName>,
) -> Result<Resolved> {
    for channel in grant.candidate_order(requested) {
        let Some(build_id) = store
            .get_channel(tenant_id, channel)?
            .and_then(|c| c.build_id)
        else {
            continue;
        };

        let Some(build) = store
            .get_build(&build_id)?
            .filter(|b| b.tenant_id == tenant_id)
        else {
            tracing::warn!(tenant = tenant_id, %channel, build = %build_id, "channel points at missing build");
            continue;
        };

        match decode(&build.artifact_key, enabled) {
            Ok(artifact) if enabled.contains(artifact.provider) => {
                return Ok(Resolved {
                    channel,
                    build,
                    artifact,
                });
            }
            Ok(artifact) => {
                tracing::debug!(%channel, provider = %artifact.provider, "skipping build on disabled provider");
            }
            Err(e) => {
                tracing::debug!(%channel, "skipping build with unusable artifact key: {e}");
            }
        }
    }

    Err(Error::NoDownloadableBuild)
}
