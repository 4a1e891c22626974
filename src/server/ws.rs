//! WebSocket endpoints
//!
//! Both the generic and the cluster-scoped sockets run the same multiplexer
//! session; the scoped variant pins which cluster frames may address.

use super::AppState;
use crate::mux;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;

pub async fn ws_multiplexer(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| {
        mux::run_socket(socket, state.store.clone(), None, state.shutdown.clone())
    })
}

pub async fn ws_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        mux::run_socket(
            socket,
            state.store.clone(),
            Some(cluster),
            state.shutdown.clone(),
        )
    })
}
