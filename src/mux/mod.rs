//! Watch multiplexer
//!
//! One WebSocket client drives any number of concurrent Kubernetes requests
//! through framed messages. The session owns a bounded outbound queue (the
//! backpressure point), a reader loop, and one task per live stream keyed by
//! `(clusterId, path, query)`.

mod frame;
mod stream;
mod upstream;

pub use frame::*;
pub use stream::*;
pub use upstream::*;

use crate::store::ContextStore;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frames buffered towards one client before producers suspend.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// How long stream tasks get to wind down when the session ends.
const SESSION_GRACE: Duration = Duration::from_secs(5);

/// One multiplexer session; lives exactly as long as its WebSocket.
pub struct MuxSession {
    store: Arc<ContextStore>,
    /// When set, frames may only address this cluster (or leave it empty)
    cluster_scope: Option<String>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    cancel: CancellationToken,
    streams: HashMap<RequestKey, StreamHandle>,
    out: Outbound,
}

impl MuxSession {
    pub fn new(
        store: Arc<ContextStore>,
        cluster_scope: Option<String>,
        out: Outbound,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cluster_scope,
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            cancel,
            streams: HashMap::new(),
            out,
        }
    }

    /// Number of streams the session currently tracks.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Process one inbound frame.
    pub async fn handle_frame(&mut self, mut inbound: Frame) {
        match inbound.frame_type {
            FrameType::Request => {
                if let Some(cluster) = self.effective_cluster(&inbound) {
                    inbound.cluster_id = cluster;
                    self.start_stream(inbound).await;
                } else {
                    let key = RequestKey::from_frame(&inbound);
                    self.out
                        .send(Frame::status(&key, StreamState::ClusterUnknown))
                        .await;
                }
            }
            FrameType::Close => {
                if let Some(cluster) = self.effective_cluster(&inbound) {
                    inbound.cluster_id = cluster;
                }
                let key = RequestKey::from_frame(&inbound);
                if let Some(handle) = self.streams.remove(&key) {
                    tracing::debug!(session = %self.session_id, key = %key, "closing stream");
                    handle.cancel.cancel();
                } else {
                    tracing::debug!(session = %self.session_id, key = %key, "CLOSE for unknown stream");
                }
            }
            other => {
                tracing::debug!(
                    session = %self.session_id,
                    "ignoring unexpected inbound {:?} frame",
                    other
                );
            }
        }
    }

    /// Resolve the cluster a frame addresses, honoring the session scope.
    fn effective_cluster(&self, frame: &Frame) -> Option<String> {
        match (&self.cluster_scope, frame.cluster_id.as_str()) {
            (Some(scope), "") => Some(scope.clone()),
            (Some(scope), id) if id == scope => Some(scope.clone()),
            (Some(_), _) => None, // out-of-scope cluster
            (None, "") => None,
            (None, id) => Some(id.to_string()),
        }
    }

    async fn start_stream(&mut self, frame: Frame) {
        let key = RequestKey::from_frame(&frame);

        let client = match self.store.client(&key.cluster_id).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(session = %self.session_id, key = %key, "cluster lookup failed: {}", e);
                self.out
                    .send(Frame::status(&key, StreamState::ClusterUnknown))
                    .await;
                return;
            }
        };

        // Duplicate REQUEST resets the existing stream: tear the old one
        // down fully before the replacement starts, so at most one upstream
        // watch exists per key.
        if let Some(existing) = self.streams.remove(&key) {
            tracing::debug!(session = %self.session_id, key = %key, "resetting existing stream");
            existing.cancel.cancel();
            let _ = existing.task.await;
        }

        let task = StreamTask {
            key: key.clone(),
            user_id: frame.user_id,
            client,
            token: frame.token,
            out: self.out.clone(),
            cancel: self.cancel.child_token(),
        };
        self.streams.insert(key, StreamHandle::spawn(task));
    }

    /// Cancel every stream and wait out the grace period.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .streams
            .drain()
            .map(|(_, handle)| handle.task)
            .collect();
        if !crate::util::join_with_deadline(handles, SESSION_GRACE).await {
            tracing::warn!(
                session = %self.session_id,
                "stream tasks did not finish within grace period"
            );
        }
    }
}

/// Drive a WebSocket through a multiplexer session until it closes.
///
/// The session token is a child of `parent`, so daemon shutdown tears down
/// every live session.
pub async fn run_socket(
    socket: WebSocket,
    store: Arc<ContextStore>,
    cluster_scope: Option<String>,
    parent: CancellationToken,
) {
    let (mut sink, mut inbound) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
    let cancel = parent.child_token();
    let mut session = MuxSession::new(
        store,
        cluster_scope,
        Outbound::new(tx, cancel.clone()),
        cancel.clone(),
    );
    let session_id = session.session_id.clone();
    tracing::info!(session = %session_id, "multiplexer session opened");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink
                .send(Message::Text(frame.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                    Ok(frame) => session.handle_frame(frame).await,
                    Err(e) => {
                        // Frame-boundary decode failure is session-fatal.
                        tracing::warn!(session = %session_id, "unparseable frame, closing session: {}", e);
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(session = %session_id, "socket error: {}", e);
                    break;
                }
            }
        }
    }

    // Child streams are cancelled and joined before the handler returns, so
    // their upstream connections are released by the time the socket is gone.
    session.shutdown().await;
    drop(session);
    let _ = writer.await;
    tracing::info!(session = %session_id, "multiplexer session closed");
}
