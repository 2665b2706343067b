//! Authorization on top of a resolved [`Principal`].

use crate::auth::{CapabilityKind, Principal};
use crate::error::{Error, Result};
use crate::resolution::AccessGrant;
use crate::store::Store;
use crate::types::{AccessLevel, Role, Tenant};

fn load_tenant(store: &dyn Store, tenant_id: &str) -> Result<Tenant> {
    store
        .get_tenant(tenant_id)?
        .ok_or_else(|| Error::NotFound(format!("pack '{tenant_id}' not found")))
}

/// Tenant a publish call targets: the credential's bound tenant, or the
/// requested one for credentials that carry none.
pub fn target_tenant(principal: &Principal, requested: Option<&str>) -> Result<String> {
    match (principal.tenant_id.as_deref(), requested.filter(|r| !r.is_empty())) {
        (Some(bound), Some(requested)) if bound != requested => Err(Error::Unauthorized(
            "credential is not bound to this pack".to_string(),
        )),
        (Some(bound), _) => Ok(bound.to_string()),
        (None, Some(requested)) => Ok(requested.to_string()),
        (None, None) => Err(Error::Validation("packId is required".to_string())),
    }
}

/// Deploy keys must be bound to the tenant; CI identities must come from the
/// tenant's configured source repository.
pub fn require_publisher(store: &dyn Store, principal: &Principal, tenant_id: &str) -> Result<Tenant> {
    let tenant = load_tenant(store, tenant_id)?;

    match principal.capability {
        CapabilityKind::PublishDeploy => {
            if principal.tenant_id.as_deref() != Some(tenant_id) {
                return Err(Error::Unauthorized(
                    "deploy key is not bound to this pack".to_string(),
                ));
            }
        }
        CapabilityKind::PublishOidc => {
            let repository = tenant.source_repository.as_deref().ok_or_else(|| {
                Error::Unauthorized("pack has no source repository configured".to_string())
            })?;
            let matches = principal
                .oidc
                .as_ref()
                .is_some_and(|identity| identity.matches_repository(repository));
            if !matches {
                tracing::warn!(
                    pack = tenant_id,
                    subject = %principal.subject_id,
                    "identity token repository does not match pack"
                );
                return Err(Error::Unauthorized(
                    "identity token is not from this pack's repository".to_string(),
                ));
            }
        }
        CapabilityKind::ReadUser | CapabilityKind::ReadRunner => {
            return Err(Error::Unauthorized(
                "publishing requires a deploy key or CI identity token".to_string(),
            ));
        }
    }

    Ok(tenant)
}

/// Publishers of the tenant, global admins and tenant admins.
pub fn require_channel_manager(
    store: &dyn Store,
    principal: &Principal,
    tenant_id: &str,
) -> Result<Tenant> {
    if principal.capability.is_publisher() {
        return require_publisher(store, principal, tenant_id);
    }

    let tenant = load_tenant(store, tenant_id)?;
    if principal.capability == CapabilityKind::ReadUser {
        if principal.is_global_admin() {
            return Ok(tenant);
        }
        let membership = store.get_membership(tenant_id, &principal.subject_id)?;
        if membership.is_some_and(|m| m.role == Role::Admin) {
            return Ok(tenant);
        }
    }

    Err(Error::Unauthorized(
        "managing channels requires a pack admin".to_string(),
    ))
}

/// The channels `principal` may read in `tenant_id`.
pub fn require_reader(
    store: &dyn Store,
    principal: &Principal,
    tenant_id: &str,
) -> Result<(Tenant, AccessGrant)> {
    let tenant = load_tenant(store, tenant_id)?;

    let grant = match principal.capability {
        CapabilityKind::ReadUser if principal.is_global_admin() => {
            AccessGrant::compute(AccessLevel::All, Role::Admin)
        }
        CapabilityKind::ReadUser => {
            let membership = store
                .get_membership(tenant_id, &principal.subject_id)?
                .ok_or_else(|| Error::Unauthorized("not a member of this pack".to_string()))?;
            AccessGrant::compute(membership.access_level, membership.role)
        }
        CapabilityKind::ReadRunner => {
            if principal.tenant_id.as_deref() != Some(tenant_id) {
                return Err(Error::Unauthorized(
                    "runner token is not bound to this pack".to_string(),
                ));
            }
            AccessGrant::compute(AccessLevel::All, Role::Member)
        }
        CapabilityKind::PublishDeploy | CapabilityKind::PublishOidc => {
            return Err(Error::Unauthorized(
                "publish credentials cannot resolve builds".to_string(),
            ));
        }
    };

    Ok((tenant, grant))
}

/// Readers and channel managers alike.
pub fn require_any_access(store: &dyn Store, principal: &Principal, tenant_id: &str) -> Result<Tenant> {
    if principal.capability.is_publisher() {
        require_publisher(store, principal, tenant_id)
    } else {
        require_reader(store, principal, tenant_id).map(|(tenant, _)| tenant)
    }
}
