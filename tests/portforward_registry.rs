//! Port-forward registry integration tests
//!
//! Everything here runs without a cluster: registry bookkeeping, error
//! mapping for unknown clusters, and request/response wire shapes.

use agentkube::portforward::{ForwardError, ForwardRequest, PortForwardRegistry};
use agentkube::store::ContextStore;
use std::sync::Arc;

fn request(cluster: &str, pod: &str) -> ForwardRequest {
    serde_json::from_value(serde_json::json!({
        "cluster": cluster,
        "namespace": "default",
        "pod": pod,
        "targetPort": 80,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_start_against_unknown_cluster() {
    let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
    let err = registry.start(request("ghost", "p1")).await.unwrap_err();
    assert!(matches!(err, ForwardError::ClusterUnknown(ref name) if name == "ghost"));
    assert!(registry.list(None).is_empty());
}

#[tokio::test]
async fn test_start_requires_pod_or_service() {
    let store = Arc::new(ContextStore::new());
    // Register a context so the request gets past cluster resolution.
    let kubeconfig = kube::config::Kubeconfig::from_yaml(
        r#"
clusters:
  - name: c
    cluster:
      server: http://127.0.0.1:6443
users:
  - name: u
    user:
      token: t
contexts:
  - name: ctxA
    context:
      cluster: c
      user: u
"#,
    )
    .unwrap();
    let contexts = agentkube::store::split_contexts(
        &kubeconfig,
        agentkube::store::ContextSource::Primary,
        "/kc",
        None,
    );
    store.replace_origin("/kc", contexts);

    let registry = PortForwardRegistry::new(store);
    let bad: ForwardRequest = serde_json::from_value(serde_json::json!({
        "cluster": "ctxA",
        "namespace": "default",
        "targetPort": 80,
    }))
    .unwrap();
    let err = registry.start(bad).await.unwrap_err();
    assert!(matches!(err, ForwardError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_get_after_delete_is_not_found() {
    let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
    // No entry at all behaves the same as a deleted one.
    assert!(registry.get("ctxA", "gone").is_none());
    let err = registry.stop("ctxA", "gone", true).await.unwrap_err();
    assert!(matches!(err, ForwardError::NotFound));
}

#[tokio::test]
async fn test_stop_all_on_empty_registry() {
    let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
    registry.stop_all().await;
    assert!(registry.list(None).is_empty());
}

#[test]
fn test_wire_shapes() {
    // Start request accepts the documented field set.
    let request: ForwardRequest = serde_json::from_str(
        r#"{"cluster":"ctxA","namespace":"ns","pod":"p1","targetPort":8080,"port":31000,"id":"fw1"}"#,
    )
    .unwrap();
    assert_eq!(request.cluster, "ctxA");
    assert_eq!(request.target_port, 8080);
    assert_eq!(request.port, Some(31000));
    assert_eq!(request.id.as_deref(), Some("fw1"));

    // Service-mode request.
    let service: ForwardRequest = serde_json::from_str(
        r#"{"cluster":"ctxA","namespace":"ns","service":"web","targetPort":80}"#,
    )
    .unwrap();
    assert!(service.pod.is_none());
    assert_eq!(service.service.as_deref(), Some("web"));
}
