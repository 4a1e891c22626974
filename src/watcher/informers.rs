//! Per-cluster informers
//!
//! One watch task per (cluster, kind). Each task runs a `kube::runtime`
//! watcher, normalizes its events, and pushes them into the cluster's
//! bounded queue. A full queue suspends the informer until the dispatcher
//! drains; nothing is silently dropped.

use super::{ClusterEvent, EventPhase};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Node, Pod, Service};
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Spawn the informer for a configured resource kind.
///
/// Unknown kinds are rejected so a typo in `resources[]` is visible at
/// startup rather than silently watching nothing.
pub fn spawn_kind(
    kind: &str,
    client: kube::Client,
    cluster: String,
    tx: mpsc::Sender<ClusterEvent>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    match kind {
        "pods" => Some(spawn_informer::<Pod>(client, cluster, "Pod", tx, cancel)),
        "events" => Some(spawn_informer::<Event>(client, cluster, "Event", tx, cancel)),
        "deployments" => Some(spawn_informer::<Deployment>(
            client,
            cluster,
            "Deployment",
            tx,
            cancel,
        )),
        "services" => Some(spawn_informer::<Service>(
            client,
            cluster,
            "Service",
            tx,
            cancel,
        )),
        "nodes" => Some(spawn_informer::<Node>(client, cluster, "Node", tx, cancel)),
        other => {
            tracing::warn!("Unknown watcher resource kind '{}', skipping", other);
            None
        }
    }
}

/// All resource kinds `spawn_kind` accepts.
pub fn supported_kinds() -> &'static [&'static str] {
    &["pods", "events", "deployments", "services", "nodes"]
}

/// Generic informer task for one resource type.
///
/// The watcher emits Apply for both creations and updates; first sight of a
/// key is normalized to Added, everything after to Modified.
fn spawn_informer<K>(
    client: kube::Client,
    cluster: String,
    kind_label: &'static str,
    tx: mpsc::Sender<ClusterEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    tokio::spawn(async move {
        let api: Api<K> = Api::all(client);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));
        let mut seen: HashSet<String> = HashSet::new();
        let mut error_count = 0u32;

        tracing::debug!(cluster = %cluster, kind = kind_label, "informer starting");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };

            match event {
                Some(Ok(watcher::Event::InitApply(obj))) | Some(Ok(watcher::Event::Apply(obj))) => {
                    error_count = 0;
                    let name = obj.name_any();
                    let namespace = obj.namespace().unwrap_or_default();
                    let key = format!("{}/{}", namespace, name);
                    let phase = if seen.insert(key) {
                        EventPhase::Added
                    } else {
                        EventPhase::Modified
                    };

                    let normalized = ClusterEvent {
                        cluster: cluster.clone(),
                        kind: kind_label.to_string(),
                        namespace,
                        name,
                        phase,
                        object: serde_json::to_value(&obj).unwrap_or_default(),
                        observed_at: chrono::Utc::now(),
                    };
                    if send_event(&tx, &cancel, normalized).await.is_err() {
                        break;
                    }
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    error_count = 0;
                    let name = obj.name_any();
                    let namespace = obj.namespace().unwrap_or_default();
                    seen.remove(&format!("{}/{}", namespace, name));

                    let normalized = ClusterEvent {
                        cluster: cluster.clone(),
                        kind: kind_label.to_string(),
                        namespace,
                        name,
                        phase: EventPhase::Deleted,
                        object: serde_json::to_value(&obj).unwrap_or_default(),
                        observed_at: chrono::Utc::now(),
                    };
                    if send_event(&tx, &cancel, normalized).await.is_err() {
                        break;
                    }
                }
                Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {
                    error_count = 0;
                }
                Some(Err(e)) => {
                    let error_string = format!("{}", e);
                    // 404 means the resource kind is not served here.
                    if error_string.contains("404") || error_string.contains("Not Found") {
                        tracing::info!(
                            cluster = %cluster,
                            kind = kind_label,
                            "resource not served by cluster, stopping informer"
                        );
                        break;
                    }

                    error_count += 1;
                    if error_count == 1 || error_count.is_multiple_of(10) {
                        tracing::warn!(
                            cluster = %cluster,
                            kind = kind_label,
                            "informer error ({}): {}",
                            error_count,
                            e
                        );
                    }
                    if error_count >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(
                            cluster = %cluster,
                            kind = kind_label,
                            "informer stopped after {} consecutive errors",
                            error_count
                        );
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(tokio::time::Duration::from_secs(1)) => {}
                    }
                }
                None => {
                    tracing::debug!(cluster = %cluster, kind = kind_label, "informer stream ended");
                    break;
                }
            }
        }

        tracing::debug!(cluster = %cluster, kind = kind_label, "informer stopped");
    })
}

/// Push into the bounded queue, giving up on cancellation.
async fn send_event(
    tx: &mpsc::Sender<ClusterEvent>,
    cancel: &CancellationToken,
    event: ClusterEvent,
) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = tx.send(event) => sent.map_err(|_| ()),
    }
}
