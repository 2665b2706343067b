use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::GlobalRole;

/// What an authenticated credential is allowed to attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    PublishDeploy,
    PublishOidc,
    ReadUser,
    ReadRunner,
}

impl CapabilityKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PublishDeploy => "publish_deploy",
            Self::PublishOidc => "publish_oidc",
            Self::ReadUser => "read_user",
            Self::ReadRunner => "read_runner",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<CapabilityKind> {
        match s {
            "publish_deploy" => Some(Self::PublishDeploy),
            "publish_oidc" => Some(Self::PublishOidc),
            "read_user" => Some(Self::ReadUser),
            "read_runner" => Some(Self::ReadRunner),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_publisher(self) -> bool {
        matches!(self, Self::PublishDeploy | Self::PublishOidc)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository identity asserted by a verified federated CI token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcIdentity {
    pub repository: Option<String>,
    pub workflow_ref: Option<String>,
    pub subject: String,
}

impl OidcIdentity {
    /// True if this identity belongs to `repository`, both by the repository
    /// claim and by the `repo:<repository>:` subject prefix.
    #[must_use]
    pub fn matches_repository(&self, repository: &str) -> bool {
        self.repository.as_deref() == Some(repository)
            && self.subject.starts_with(&format!("repo:{repository}:"))
    }
}

/// Normalized result of credential resolution. Built per request, never stored.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Bound tenant. `None` for user sessions and federated identities, whose
    /// tenant is decided by the authorization layer.
    pub tenant_id: Option<String>,
    pub capability: CapabilityKind,
    pub subject_id: String,
    pub global_role: Option<GlobalRole>,
    pub oidc: Option<OidcIdentity>,
}

impl Principal {
    #[must_use]
    pub fn deploy(tenant_id: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            capability: CapabilityKind::PublishDeploy,
            subject_id: key_id.into(),
            global_role: None,
            oidc: None,
        }
    }

    #[must_use]
    pub fn oidc(identity: OidcIdentity) -> Self {
        Self {
            tenant_id: None,
            capability: CapabilityKind::PublishOidc,
            subject_id: identity.subject.clone(),
            global_role: None,
            oidc: Some(identity),
        }
    }

    #[must_use]
    pub fn user(user_id: impl Into<String>, global_role: GlobalRole) -> Self {
        Self {
            tenant_id: None,
            capability: CapabilityKind::ReadUser,
            subject_id: user_id.into(),
            global_role: Some(global_role),
            oidc: None,
        }
    }

    #[must_use]
    pub fn runner(tenant_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            capability: CapabilityKind::ReadRunner,
            subject_id: token_id.into(),
            global_role: None,
            oidc: None,
        }
    }

    #[must_use]
    pub fn is_global_admin(&self) -> bool {
        self.global_role == Some(GlobalRole::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_roundtrip() {
        for kind in [
            CapabilityKind::PublishDeploy,
            CapabilityKind::PublishOidc,
            CapabilityKind::ReadUser,
            CapabilityKind::ReadRunner,
        ] {
            assert_eq!(CapabilityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CapabilityKind::parse("admin"), None);
    }

    #[test]
    fn test_repository_binding() {
        let identity = OidcIdentity {
            repository: Some("acme/pack".to_string()),
            workflow_ref: None,
            subject: "repo:acme/pack:ref:refs/heads/main".to_string(),
        };
        assert!(identity.matches_repository("acme/pack"));
        assert!(!identity.matches_repository("acme/pack-two"));
        assert!(!identity.matches_repository("acme"));

        let spoofed = OidcIdentity {
            repository: Some("acme/pack".to_string()),
            workflow_ref: None,
            subject: "repo:evil/pack:ref:refs/heads/main".to_string(),
        };
        assert!(!spoofed.matches_repository("acme/pack"));
    }
}
