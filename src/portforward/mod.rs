//! Port-forward registry
//!
//! Indexed cache of active tunnels keyed by `(cluster, id)`. Starting a
//! forward binds the local listener first (allocation failure surfaces
//! before anything is registered), probes the pod, then records the entry
//! as Running and hands it to a supervisor task. Operations on different
//! ids run in parallel; operations on one id serialize through a per-entry
//! lock.

mod tunnel;

pub use tunnel::*;

use crate::store::{ContextStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Port-forward failure kinds.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unknown cluster: {0}")]
    ClusterUnknown(String),

    #[error("local port {0} is already in use")]
    PortInUse(u16),

    #[error("pod unavailable: {0}")]
    PodUnavailable(String),

    #[error("forward {0} already exists")]
    AlreadyExists(String),

    #[error("forward not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ForwardError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownContext(name) => ForwardError::ClusterUnknown(name),
            other => ForwardError::Internal(other.to_string()),
        }
    }
}

/// Start request, as received from the REST layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub cluster: String,
    pub namespace: String,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub service_namespace: Option<String>,
    pub target_port: u16,
    /// Local port; system-assigned when omitted
    #[serde(default)]
    pub port: Option<u16>,
    /// Forward id; server-generated when omitted
    #[serde(default)]
    pub id: Option<String>,
}

/// Tunnel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardStatus {
    Running,
    Stopped,
    Error,
}

/// One registered port-forward.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub id: String,
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_namespace: Option<String>,
    pub target_port: u16,
    pub local_port: u16,
    pub status: ForwardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    record: Mutex<PortForward>,
    /// Serializes stop/delete against each other for this id
    op_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Entry {
    fn snapshot(&self) -> PortForward {
        self.record.lock().expect("forward record lock poisoned").clone()
    }
}

/// The shared registry of tunnels.
pub struct PortForwardRegistry {
    store: Arc<ContextStore>,
    entries: RwLock<HashMap<(String, String), Arc<Entry>>>,
}

impl PortForwardRegistry {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Start a forward and register it.
    pub async fn start(&self, request: ForwardRequest) -> Result<PortForward, ForwardError> {
        if request.pod.is_none() && request.service.is_none() {
            return Err(ForwardError::InvalidRequest(
                "either pod or service is required".to_string(),
            ));
        }

        let client = self.store.client(&request.cluster).await?;

        // Service mode resolves endpoints once, at start time.
        let pod = match (&request.pod, &request.service) {
            (Some(pod), _) => pod.clone(),
            (None, Some(service)) => {
                let namespace = request
                    .service_namespace
                    .as_deref()
                    .unwrap_or(&request.namespace);
                resolve_service_pod(&client, namespace, service).await?
            }
            (None, None) => unreachable!("validated above"),
        };

        let id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
        let key = (request.cluster.clone(), id.clone());
        if self.entries.read().expect("registry lock poisoned").contains_key(&key) {
            return Err(ForwardError::AlreadyExists(id));
        }

        let target = TunnelTarget {
            client,
            namespace: request.namespace.clone(),
            pod: pod.clone(),
            target_port: request.target_port,
        };
        probe_target(&target).await?;

        // Bind before registering: Running means the listener is live.
        let (listener, local_port) = bind_listener(request.port).await?;

        let record = PortForward {
            id: id.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace,
            pod,
            service: request.service,
            service_namespace: request.service_namespace,
            target_port: request.target_port,
            local_port,
            status: ForwardStatus::Running,
            error: None,
            created_at: Utc::now(),
        };

        let cancel = CancellationToken::new();
        let entry = Arc::new(Entry {
            record: Mutex::new(record.clone()),
            op_lock: tokio::sync::Mutex::new(()),
            cancel: cancel.clone(),
            supervisor: Mutex::new(None),
        });

        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            if entries.contains_key(&key) {
                return Err(ForwardError::AlreadyExists(id));
            }
            entries.insert(key.clone(), entry.clone());
        }

        let supervisor_entry = entry.clone();
        let handle = tokio::spawn(async move {
            let exit = run_tunnel(listener, target, cancel).await;
            // run_tunnel dropped the listener already; the record may now
            // leave Running.
            let mut record = supervisor_entry
                .record
                .lock()
                .expect("forward record lock poisoned");
            match exit {
                TunnelExit::Stopped => {
                    record.status = ForwardStatus::Stopped;
                }
                TunnelExit::Failed(message) => {
                    tracing::warn!(id = %record.id, "port-forward failed: {}", message);
                    record.status = ForwardStatus::Error;
                    record.error = Some(message);
                }
            }
        });
        *entry.supervisor.lock().expect("supervisor lock poisoned") = Some(handle);

        tracing::info!(
            id = %record.id,
            cluster = %record.cluster,
            pod = %record.pod,
            local_port = record.local_port,
            target_port = record.target_port,
            "port-forward started"
        );
        Ok(record)
    }

    /// Stop a forward; with `delete` also drop the record.
    pub async fn stop(&self, cluster: &str, id: &str, delete: bool) -> Result<(), ForwardError> {
        let key = (cluster.to_string(), id.to_string());
        let entry = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .get(&key)
            .cloned()
            .ok_or(ForwardError::NotFound)?;

        {
            let _op = entry.op_lock.lock().await;
            entry.cancel.cancel();
            let handle = entry
                .supervisor
                .lock()
                .expect("supervisor lock poisoned")
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        if delete {
            self.entries
                .write()
                .expect("registry lock poisoned")
                .remove(&key);
            tracing::info!(id, cluster, "port-forward deleted");
        } else {
            tracing::info!(id, cluster, "port-forward stopped");
        }
        Ok(())
    }

    /// All forwards, optionally narrowed to one cluster.
    pub fn list(&self, cluster: Option<&str>) -> Vec<PortForward> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut forwards: Vec<PortForward> = entries
            .iter()
            .filter(|((c, _), _)| cluster.is_none_or(|want| want == c))
            .map(|(_, entry)| entry.snapshot())
            .collect();
        forwards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        forwards
    }

    pub fn get(&self, cluster: &str, id: &str) -> Option<PortForward> {
        let key = (cluster.to_string(), id.to_string());
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(&key)
            .map(|entry| entry.snapshot())
    }

    /// Stop every tunnel; used at daemon shutdown.
    pub async fn stop_all(&self) {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for entry in entries {
            entry.cancel.cancel();
            let handle = entry
                .supervisor
                .lock()
                .expect("supervisor lock poisoned")
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, record: PortForward) {
        let key = (record.cluster.clone(), record.id.clone());
        let entry = Arc::new(Entry {
            record: Mutex::new(record),
            op_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });
        self.entries.write().unwrap().insert(key, entry);
    }
}

impl std::fmt::Debug for PortForwardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForwardRegistry")
            .field("entries", &self.entries.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(cluster: &str, id: &str, port: u16) -> PortForward {
        PortForward {
            id: id.to_string(),
            cluster: cluster.to_string(),
            namespace: "default".to_string(),
            pod: "p1".to_string(),
            service: None,
            service_namespace: None,
            target_port: 80,
            local_port: port,
            status: ForwardStatus::Running,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_unknown_cluster() {
        let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
        let err = registry
            .start(ForwardRequest {
                cluster: "nope".into(),
                namespace: "default".into(),
                pod: Some("p1".into()),
                service: None,
                service_namespace: None,
                target_port: 80,
                port: None,
                id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::ClusterUnknown(_)));
        assert!(registry.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_stop_missing_is_not_found() {
        let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
        let err = registry.stop("ctxA", "missing", false).await.unwrap_err();
        assert!(matches!(err, ForwardError::NotFound));
    }

    #[tokio::test]
    async fn test_stop_keeps_record_delete_removes_it() {
        let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
        registry.insert_for_test(sample_record("ctxA", "fwd-1", 30001));

        registry.stop("ctxA", "fwd-1", false).await.unwrap();
        let kept = registry.get("ctxA", "fwd-1").unwrap();
        // Supervisor is absent in the fixture, so status stays as inserted;
        // the record itself must still be queryable after a plain stop.
        assert_eq!(kept.id, "fwd-1");

        registry.stop("ctxA", "fwd-1", true).await.unwrap();
        assert!(registry.get("ctxA", "fwd-1").is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_cluster() {
        let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
        registry.insert_for_test(sample_record("ctxA", "a1", 30001));
        registry.insert_for_test(sample_record("ctxA", "a2", 30002));
        registry.insert_for_test(sample_record("ctxB", "b1", 30003));

        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some("ctxA")).len(), 2);
        assert_eq!(registry.list(Some("ctxB")).len(), 1);
        assert!(registry.list(Some("ctxC")).is_empty());
    }

    #[tokio::test]
    async fn test_running_local_ports_are_distinct() {
        let registry = PortForwardRegistry::new(Arc::new(ContextStore::new()));
        registry.insert_for_test(sample_record("ctxA", "a1", 30001));
        registry.insert_for_test(sample_record("ctxA", "a2", 30002));

        let running: Vec<u16> = registry
            .list(None)
            .into_iter()
            .filter(|f| f.status == ForwardStatus::Running)
            .map(|f| f.local_port)
            .collect();
        let mut deduped = running.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(running.len(), deduped.len());
    }

    #[test]
    fn test_request_parses_with_defaults() {
        let request: ForwardRequest = serde_json::from_str(
            r#"{"cluster":"ctxA","namespace":"default","pod":"p1","targetPort":80}"#,
        )
        .unwrap();
        assert_eq!(request.pod.as_deref(), Some("p1"));
        assert!(request.port.is_none());
        assert!(request.id.is_none());

        let service: ForwardRequest = serde_json::from_str(
            r#"{"cluster":"ctxA","namespace":"default","service":"web","serviceNamespace":"svc-ns","targetPort":8080,"port":9000,"id":"fwd"}"#,
        )
        .unwrap();
        assert_eq!(service.service.as_deref(), Some("web"));
        assert_eq!(service.service_namespace.as_deref(), Some("svc-ns"));
        assert_eq!(service.port, Some(9000));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_string(&sample_record("ctxA", "fwd-1", 30001)).unwrap();
        assert!(json.contains(r#""localPort":30001"#));
        assert!(json.contains(r#""targetPort":80"#));
        assert!(json.contains(r#""status":"Running""#));
        assert!(!json.contains("service"));
    }
}
