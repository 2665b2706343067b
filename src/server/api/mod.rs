pub mod access;
mod channels;
mod client;
mod publish;
mod runner;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::server::AppState;

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Publishing
        .route("/builds/presign", post(publish::presign))
        .route("/builds", post(publish::publish))
        .route(
            "/tenants/{tenant_id}/uploads/client-token",
            post(publish::client_token),
        )
        // Channel management
        .route("/tenants/{tenant_id}/channels", get(channels::list_channels))
        .route(
            "/tenants/{tenant_id}/channels/{channel}/promote",
            post(channels::promote),
        )
        .route(
            "/tenants/{tenant_id}/builds/{build_id}/force-reinstall",
            put(channels::set_force_reinstall),
        )
        // Clients
        .route("/tenants/{tenant_id}/resolve", get(client::resolve_build))
        .route("/public/{tenant_id}/latest", get(client::public_latest))
        // Runners
        .route("/runner/token", post(runner::exchange_token))
}
