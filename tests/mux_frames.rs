//! Multiplexer session behavior without an upstream cluster
//!
//! Drives MuxSession directly through its frame interface and asserts on
//! the outbound queue: unknown clusters, scope enforcement, and teardown.

use agentkube::mux::{Frame, FrameType, MuxSession, Outbound, StatusPayload, StreamState};
use agentkube::store::ContextStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn session(
    scope: Option<&str>,
) -> (MuxSession, mpsc::Receiver<Frame>, CancellationToken) {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let store = Arc::new(ContextStore::new());
    let session = MuxSession::new(
        store,
        scope.map(|s| s.to_string()),
        Outbound::new(tx, cancel.clone()),
        cancel.clone(),
    );
    (session, rx, cancel)
}

fn request_frame(cluster: &str, path: &str, query: &str) -> Frame {
    Frame::parse(&format!(
        r#"{{"clusterId":"{}","path":"{}","query":"{}","type":"REQUEST"}}"#,
        cluster, path, query
    ))
    .unwrap()
}

fn status_of(frame: &Frame) -> StreamState {
    assert_eq!(frame.frame_type, FrameType::Status);
    serde_json::from_str::<StatusPayload>(&frame.data).unwrap().state
}

#[tokio::test]
async fn test_request_for_unknown_cluster() {
    let (mut session, mut rx, _cancel) = session(None);
    session
        .handle_frame(request_frame("ghost", "/api/v1/pods", "watch=true"))
        .await;

    let frame = rx.recv().await.unwrap();
    assert_eq!(status_of(&frame), StreamState::ClusterUnknown);
    assert_eq!(frame.cluster_id, "ghost");
    assert_eq!(session.active_streams(), 0, "no stream recorded");
}

#[tokio::test]
async fn test_scoped_session_rejects_other_cluster() {
    let (mut session, mut rx, _cancel) = session(Some("ctxA"));
    session
        .handle_frame(request_frame("ctxB", "/api/v1/pods", ""))
        .await;

    let frame = rx.recv().await.unwrap();
    assert_eq!(status_of(&frame), StreamState::ClusterUnknown);
}

#[tokio::test]
async fn test_scoped_session_scopes_empty_cluster_id() {
    // The scope name is applied, so the failure names the scoped cluster
    // (which is unknown in an empty store).
    let (mut session, mut rx, _cancel) = session(Some("ctxA"));
    session.handle_frame(request_frame("", "/api/v1/pods", "")).await;

    let frame = rx.recv().await.unwrap();
    assert_eq!(frame.cluster_id, "ctxA");
    assert_eq!(status_of(&frame), StreamState::ClusterUnknown);
}

#[tokio::test]
async fn test_close_then_request_is_fresh() {
    let (mut session, mut rx, _cancel) = session(None);

    // CLOSE for a never-opened key emits nothing.
    let mut close = request_frame("ctxA", "/api/v1/pods", "watch=true");
    close.frame_type = FrameType::Close;
    session.handle_frame(close).await;
    assert!(rx.try_recv().is_err());

    // A REQUEST afterwards behaves like any first request.
    session
        .handle_frame(request_frame("ctxA", "/api/v1/pods", "watch=true"))
        .await;
    let frame = rx.recv().await.unwrap();
    assert_eq!(status_of(&frame), StreamState::ClusterUnknown);
}

#[tokio::test]
async fn test_shutdown_with_no_streams_is_quick() {
    let (mut session, _rx, cancel) = session(None);
    let start = tokio::time::Instant::now();
    session.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn test_frame_roundtrip_through_json() {
    let frame = Frame {
        cluster_id: "ctxA".to_string(),
        user_id: "u1".to_string(),
        path: "/api/v1/pods".to_string(),
        query: "watch=true&labelSelector=app%3Dweb".to_string(),
        frame_type: FrameType::Request,
        data: String::new(),
        token: Some("bearer-override".to_string()),
    };
    let parsed = Frame::parse(&serde_json::to_string(&frame).unwrap()).unwrap();
    assert_eq!(parsed.cluster_id, frame.cluster_id);
    assert_eq!(parsed.query, frame.query);
    assert_eq!(parsed.token.as_deref(), Some("bearer-override"));
}
