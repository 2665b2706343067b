//! Proxy routes behind the blob backend. The query token is the only
//! credential these routes accept.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use tokio_util::io::ReaderStream;

use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::StorageTokenQuery;
use crate::server::extract::ClientIp;
use crate::server::response::ApiError;
use crate::storage::{DOWNLOAD_ROUTE, Provider, ProxyBackend, StorageAction, UPLOAD_ROUTE};

pub fn internal_router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route(DOWNLOAD_ROUTE, get(download))
        .route(
            UPLOAD_ROUTE,
            put(upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
}

fn proxy(state: &AppState) -> Result<&ProxyBackend, ApiError> {
    state
        .storage
        .proxy()
        .ok_or_else(|| Error::ProviderUnavailable(Provider::Blob).into())
}

fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}

pub async fn download(
    ClientIp(ip): ClientIp,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StorageTokenQuery>,
) -> Result<Response, ApiError> {
    state.rate_limiter.check(&ip)?;

    let proxy = proxy(&state)?;
    let token = proxy.verify(&query.token, StorageAction::Download)?;

    let (reader, size) = proxy.store().get(&token.key).await.map_err(Error::from)?;

    let body = Body::from_stream(ReaderStream::new(reader));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header("X-Content-Type-Options", "nosniff")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StorageTokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let proxy = proxy(&state)?;
    let token = proxy.verify(&query.token, StorageAction::Upload)?;

    // Delegated client uploads are bound to one content type.
    if let Some(expected) = token.content_type.as_deref() {
        let actual = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(media_type)
            .unwrap_or_default();
        if !actual.eq_ignore_ascii_case(media_type(expected)) {
            return Err(ApiError::bad_request(format!(
                "content type must be '{expected}'"
            )));
        }
    }

    proxy
        .store()
        .put(&token.key, &body)
        .await
        .map_err(Error::from)?;

    tracing::info!(key = %token.key, bytes = body.len(), "stored object");
    Ok(StatusCode::OK)
}
