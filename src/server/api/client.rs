use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
};

use super::access::require_reader;
use super::publish::parse_channel;
use crate::auth::Authenticated;
use crate::error::Error;
use crate::resolution::{AccessGrant, resolve};
use crate::server::AppState;
use crate::server::dto::{ResolveParams, ResolvedBuild};
use crate::server::extract::ClientIp;
use crate::server::response::ApiError;
use crate::types::ChannelName;

/// The build an authenticated client should be running.
pub async fn resolve_build(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<ResolvedBuild>, ApiError> {
    state
        .rate_limiter
        .check(&format!("{}:{}", principal.capability, principal.subject_id))?;

    let (_, grant) = require_reader(state.store.as_ref(), &principal, &tenant_id)?;
    let requested = parse_channel(params.channel.as_deref())?;

    let resolved = resolve(
        state.store.as_ref(),
        state.storage.enabled(),
        &tenant_id,
        &grant,
        requested,
    )?;
    let requires_full_reinstall = state.registry.compute_requires_full_reinstall(
        &tenant_id,
        &resolved.build,
        params.current_build_id.as_deref(),
    )?;
    let download = state
        .storage
        .download_access(&resolved.artifact)
        .map_err(Error::from)?;

    tracing::debug!(
        pack = %tenant_id,
        channel = %resolved.channel,
        build = %resolved.build.id,
        requires_full_reinstall,
        "resolved build"
    );

    Ok(Json(ResolvedBuild::new(resolved, download, requires_full_reinstall)))
}

/// Production build of a public pack, without credentials.
pub async fn public_latest(
    ClientIp(ip): ClientIp,
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<ResolvedBuild>, ApiError> {
    state.rate_limiter.check(&ip)?;

    // Private packs read as absent.
    let tenant = state
        .store
        .get_tenant(&tenant_id)?
        .filter(|t| t.public)
        .ok_or_else(|| Error::NotFound(format!("pack '{tenant_id}' not found")))?;

    let resolved = resolve(
        state.store.as_ref(),
        state.storage.enabled(),
        &tenant.id,
        &AccessGrant::public(),
        Some(ChannelName::Production),
    )?;
    let download = state
        .storage
        .download_access(&resolved.artifact)
        .map_err(Error::from)?;

    Ok(Json(ResolvedBuild::new(resolved, download, false)))
}
