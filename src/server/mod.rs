//! HTTP surface
//!
//! Thin translation layer: REST routes call into the context store and
//! port-forward registry, WebSocket routes hand their sockets to the
//! multiplexer. No business logic lives here.

mod routes;
mod ws;

pub use routes::*;
pub use ws::*;

use crate::portforward::PortForwardRegistry;
use crate::store::ContextStore;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ContextStore>,
    pub forwards: Arc<PortForwardRegistry>,
    /// Root shutdown token; WebSocket sessions attach below it
    pub shutdown: CancellationToken,
}

/// Build the daemon router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/contexts", get(list_contexts))
        .route(
            "/api/v1/contexts/{name}",
            get(get_context).delete(delete_context),
        )
        .route("/api/v1/kubeconfig/upload", post(upload_kubeconfig))
        .route("/api/v1/kubeconfig/validate", post(validate_kubeconfig))
        .route("/api/v1/portforward/start", post(start_portforward))
        .route("/api/v1/portforward/stop", post(stop_portforward))
        .route("/api/v1/portforward", get(list_portforwards))
        .route("/api/v1/portforward/{id}", get(get_portforward))
        .route("/ws", get(ws_multiplexer))
        .route("/wsMultiplexer", get(ws_multiplexer))
        .route("/api/v1/socket/clusters/{cluster}/ws", get(ws_cluster))
        .route("/api/v1/socket/clusters/{cluster}/watch", get(ws_cluster))
        .with_state(state)
}
