use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};

use super::access::{require_any_access, require_channel_manager};
use super::publish::parse_channel;
use crate::auth::Authenticated;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{ForceReinstallRequest, PromoteRequest};
use crate::server::response::ApiError;
use crate::types::{Build, Channel};

pub async fn list_channels(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<Channel>>, ApiError> {
    require_any_access(state.store.as_ref(), &principal, &tenant_id)?;
    Ok(Json(state.registry.channels(&tenant_id)?))
}

pub async fn promote(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((tenant_id, channel)): Path<(String, String)>,
    Json(request): Json<PromoteRequest>,
) -> Result<Json<Channel>, ApiError> {
    require_channel_manager(state.store.as_ref(), &principal, &tenant_id)?;

    let channel = parse_channel(Some(&channel))?
        .ok_or_else(|| Error::Validation("channel is required".to_string()))?;
    let pointer = state.registry.promote(&tenant_id, channel, &request.build_id)?;

    Ok(Json(pointer))
}

pub async fn set_force_reinstall(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((tenant_id, build_id)): Path<(String, String)>,
    Json(request): Json<ForceReinstallRequest>,
) -> Result<Json<Build>, ApiError> {
    require_channel_manager(state.store.as_ref(), &principal, &tenant_id)?;

    let build = state
        .registry
        .set_force_reinstall(&tenant_id, &build_id, request.force_reinstall)?;
    tracing::info!(
        pack = %tenant_id,
        build = %build_id,
        force_reinstall = request.force_reinstall,
        "updated force reinstall flag"
    );

    Ok(Json(build))
}
