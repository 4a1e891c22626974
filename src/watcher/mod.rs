//! Cluster watcher
//!
//! For each allowed cluster, a set of informers observes the configured
//! resource kinds and feeds a bounded per-cluster queue; a dispatch task
//! drains each queue into the configured sink. Cluster filtering follows
//! the include/skip precedence from [`crate::config::WatcherConfig`].

mod dispatch;
mod informers;

pub use dispatch::*;
pub use informers::*;

use crate::config::WatcherConfig;
use crate::store::ContextStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queue depth per cluster between informers and the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// How long shutdown waits for informers and dispatchers to wind down.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Resource lifecycle phase of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventPhase {
    Added,
    Modified,
    Deleted,
}

/// One normalized event, as handed to dispatchers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    pub cluster: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub phase: EventPhase,
    pub object: serde_json::Value,
    pub observed_at: DateTime<Utc>,
}

impl ClusterEvent {
    /// Coalescing key: same object, any phase.
    pub fn object_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.cluster, self.kind, self.namespace, self.name
        )
    }
}

/// Owns every informer and dispatch task.
pub struct ClusterWatcher {
    config: WatcherConfig,
    store: Arc<ContextStore>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ClusterWatcher {
    pub fn new(config: WatcherConfig, store: Arc<ContextStore>, cancel: CancellationToken) -> Self {
        Self {
            config,
            store,
            cancel,
            handles: Vec::new(),
        }
    }

    /// Compute which registered clusters the watcher covers.
    pub fn allowed_clusters(&self) -> Vec<String> {
        self.store
            .list()
            .into_iter()
            .filter(|c| self.config.allows_cluster(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Start informers and dispatch loops for every allowed cluster.
    ///
    /// Clusters whose client cannot be built are skipped with a warning;
    /// one bad kubeconfig must not take the watcher down.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            tracing::info!("Cluster watcher disabled");
            return Ok(());
        }

        let dispatcher = build_dispatcher(&self.config.handler).await;
        let clusters = self.allowed_clusters();
        tracing::info!(
            "Starting cluster watcher: {} cluster(s), kinds {:?}, sink {}",
            clusters.len(),
            self.config.resources,
            dispatcher.name()
        );

        for cluster in clusters {
            let client = match self.store.client(&cluster).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("Skipping watcher for '{}': {}", cluster, e);
                    continue;
                }
            };

            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            for kind in &self.config.resources {
                if let Some(handle) = spawn_kind(
                    kind,
                    client.clone(),
                    cluster.clone(),
                    tx.clone(),
                    self.cancel.child_token(),
                ) {
                    self.handles.push(handle);
                }
            }
            drop(tx);

            self.handles.push(tokio::spawn(run_dispatch_loop(
                rx,
                dispatcher.clone(),
                self.config.coalesce,
                self.cancel.child_token(),
            )));
        }

        Ok(())
    }

    /// Cancel everything and wait out the shutdown deadline.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut self.handles);
        let count = handles.len();
        if !crate::util::join_with_deadline(handles, SHUTDOWN_DEADLINE).await {
            tracing::warn!("Watcher tasks did not stop within {:?}", SHUTDOWN_DEADLINE);
        } else {
            tracing::debug!("Stopped {} watcher task(s)", count);
        }
    }
}

impl std::fmt::Debug for ClusterWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterWatcher")
            .field("enabled", &self.config.enabled)
            .field("tasks", &self.handles.len())
            .finish()
    }
}
