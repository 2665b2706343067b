use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use uuid::Uuid;

use super::access::{require_publisher, target_tenant};
use crate::auth::Authenticated;
use crate::error::Error;
use crate::registry::PublishRequest;
use crate::server::AppState;
use crate::server::dto::{
    ClientTokenRequest, ClientTokenResponse, PresignRequest, PresignResponse, PublishBody,
    PublishResponse,
};
use crate::server::response::ApiError;
use crate::server::validation::{require_tenant_key, validate_build_id, validate_extension};
use crate::storage::{ArtifactRef, Provider, encode};
use crate::types::ChannelName;

const DEFAULT_ARTIFACT_EXTENSION: &str = "zip";

pub(super) fn parse_channel(raw: Option<&str>) -> Result<Option<ChannelName>, Error> {
    raw.filter(|c| !c.is_empty())
        .map(|c| {
            ChannelName::parse(c).ok_or_else(|| {
                Error::Validation(format!(
                    "unknown channel '{c}', expected dev, beta or production"
                ))
            })
        })
        .transpose()
}

/// Allocates a build id and hands back where to upload its artifact.
pub async fn presign(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PresignRequest>,
) -> Result<Json<PresignResponse>, ApiError> {
    let tenant_id = target_tenant(&principal, request.pack_id.as_deref())?;
    require_publisher(state.store.as_ref(), &principal, &tenant_id)?;

    let extension = request
        .extension
        .as_deref()
        .map(|e| e.trim_start_matches('.'))
        .unwrap_or(DEFAULT_ARTIFACT_EXTENSION);
    validate_extension(extension)?;

    let provider = state
        .storage
        .enabled()
        .preferred()
        .ok_or(Error::NoProviderEnabled)?;

    let build_id = Uuid::new_v4().to_string();
    let reference = ArtifactRef::new(provider, format!("{tenant_id}/builds/{build_id}.{extension}"));
    let access = state
        .storage
        .upload_access(&reference, request.content_type.as_deref())
        .map_err(Error::from)?;

    Ok(Json(PresignResponse {
        build_id,
        artifact_key: encode(&reference),
        artifact_provider: provider,
        upload_url: access.url,
        upload_method: access.method,
        expires_at: access.expires_at,
    }))
}

/// Records a build and points the named channel at it. Safe to retry.
pub async fn publish(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PublishBody>,
) -> Result<Json<PublishResponse>, ApiError> {
    let tenant_id = target_tenant(&principal, body.pack_id.as_deref())?;
    require_publisher(state.store.as_ref(), &principal, &tenant_id)?;

    validate_build_id(&body.build_id)?;
    let channel = parse_channel(body.channel.as_deref())?
        .ok_or_else(|| Error::Validation("channel is required".to_string()))?;

    let reference = state.registry.artifact(&body.artifact_key)?;
    require_tenant_key(&tenant_id, &reference.key)?;

    let info = state
        .storage
        .head(&reference)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| {
            Error::Validation(format!(
                "artifact '{}' has not been uploaded",
                encode(&reference)
            ))
        })?;

    let published = state.registry.publish_build(
        &tenant_id,
        PublishRequest {
            build_id: body.build_id,
            version: body.version,
            commit_hash: body.commit_hash,
            artifact_key: encode(&reference),
            artifact_size: body.artifact_size.or(info.size),
            metadata: body.metadata,
            channel: Some(channel),
        },
    )?;

    Ok(Json(published.into()))
}

/// Delegated upload grant for one pathname and one content type.
pub async fn client_token(
    Authenticated(principal): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Json(request): Json<ClientTokenRequest>,
) -> Result<Json<ClientTokenResponse>, ApiError> {
    require_publisher(state.store.as_ref(), &principal, &tenant_id)?;

    let pathname = request.pathname.trim_start_matches('/');
    require_tenant_key(&tenant_id, pathname)?;

    let proxy = state
        .storage
        .proxy()
        .ok_or(Error::ProviderUnavailable(Provider::Blob))?;
    let grant = proxy
        .client_upload(pathname, &request.content_type)
        .map_err(Error::from)?;

    Ok(Json(ClientTokenResponse {
        artifact_key: encode(&ArtifactRef::new(Provider::Blob, pathname)),
        grant,
    }))
}
