//! Event dispatchers
//!
//! A dispatcher is the sink for normalized cluster events. The default
//! variant drops everything; the webhook variant POSTs JSON with retry.
//! Retries happen in the drain loop, so a flapping sink slows the queue
//! down rather than losing causal order.

use super::ClusterEvent;
use crate::config::{HandlerConfig, WebhookConfig};
use crate::util::Backoff;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_DELIVERY_ATTEMPTS: u32 = 10;
const COALESCE_WINDOW: Duration = Duration::from_millis(50);
const FLUSH_DEADLINE: Duration = Duration::from_secs(10);

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Ok,
    /// Worth retrying: 5xx, 408, 429, or a transport failure
    Retriable(String),
    /// Not worth retrying: any other 4xx
    Fatal(String),
}

/// Polymorphic event sink.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn init(&self) -> anyhow::Result<()>;
    async fn deliver(&self, event: &ClusterEvent) -> Delivery;
    fn name(&self) -> &'static str;
}

/// Sink of last resort: drops events. Used when no webhook is configured or
/// the webhook failed to initialize.
pub struct DefaultDispatcher;

#[async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deliver(&self, event: &ClusterEvent) -> Delivery {
        tracing::trace!(
            cluster = %event.cluster,
            kind = %event.kind,
            name = %event.name,
            "dropping event (default dispatcher)"
        );
        Delivery::Ok
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// POSTs each event as JSON to a configured URL.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let url: reqwest::Url = config
            .url
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid webhook url '{}': {}", config.url, e))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deliver(&self, event: &ClusterEvent) -> Delivery {
        let response = match self.client.post(&self.url).json(event).send().await {
            Ok(response) => response,
            Err(e) => return Delivery::Retriable(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return Delivery::Ok;
        }
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Delivery::Retriable(format!("webhook returned {}", status))
        } else {
            Delivery::Fatal(format!("webhook returned {}", status))
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Build the configured dispatcher, falling back to the default sink when
/// the webhook cannot be initialized.
pub async fn build_dispatcher(handler: &HandlerConfig) -> Arc<dyn Dispatcher> {
    if let Some(webhook) = &handler.webhook {
        match WebhookDispatcher::new(webhook) {
            Ok(dispatcher) => match dispatcher.init().await {
                Ok(()) => return Arc::new(dispatcher),
                Err(e) => {
                    tracing::error!("Webhook dispatcher init failed, dropping events: {}", e)
                }
            },
            Err(e) => tracing::error!("Webhook dispatcher config invalid, dropping events: {}", e),
        }
    }
    Arc::new(DefaultDispatcher)
}

/// Drain one cluster's event queue into the dispatcher.
///
/// With coalescing enabled, events for the same object arriving within the
/// window collapse to the latest one. On cancellation the remaining queue is
/// flushed under a bounded deadline, then dropped.
pub async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<ClusterEvent>,
    dispatcher: Arc<dyn Dispatcher>,
    coalesce: bool,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let batch = if coalesce {
            coalesce_window(first, &mut rx).await
        } else {
            vec![first]
        };

        for event in batch {
            deliver_with_retry(dispatcher.as_ref(), &event, &cancel).await;
        }
    }

    flush_remaining(&mut rx, dispatcher.as_ref()).await;
}

/// Collect events for the coalescing window, keeping only the latest per
/// `(cluster, kind, namespace, name)` while preserving first-arrival order.
async fn coalesce_window(
    first: ClusterEvent,
    rx: &mut mpsc::Receiver<ClusterEvent>,
) -> Vec<ClusterEvent> {
    let mut order: Vec<String> = vec![first.object_key()];
    let mut latest: HashMap<String, ClusterEvent> = HashMap::from([(first.object_key(), first)]);

    let window = tokio::time::sleep(COALESCE_WINDOW);
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            event = rx.recv() => match event {
                Some(event) => {
                    let key = event.object_key();
                    if !latest.contains_key(&key) {
                        order.push(key.clone());
                    }
                    latest.insert(key, event);
                }
                None => break,
            },
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

async fn deliver_with_retry(
    dispatcher: &dyn Dispatcher,
    event: &ClusterEvent,
    cancel: &CancellationToken,
) {
    let mut backoff = Backoff::watch();
    loop {
        match dispatcher.deliver(event).await {
            Delivery::Ok => return,
            Delivery::Fatal(message) => {
                tracing::warn!(
                    sink = dispatcher.name(),
                    kind = %event.kind,
                    name = %event.name,
                    "dropping event after fatal delivery error: {}",
                    message
                );
                return;
            }
            Delivery::Retriable(message) => {
                if backoff.attempts() >= MAX_DELIVERY_ATTEMPTS {
                    tracing::warn!(
                        sink = dispatcher.name(),
                        kind = %event.kind,
                        name = %event.name,
                        "dropping event after {} attempts: {}",
                        backoff.attempts(),
                        message
                    );
                    return;
                }
                let delay = backoff.next_delay();
                tracing::debug!(
                    sink = dispatcher.name(),
                    "delivery attempt {} failed ({}), retrying in {:?}",
                    backoff.attempts(),
                    message,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Best-effort flush of whatever is still queued at shutdown.
async fn flush_remaining(rx: &mut mpsc::Receiver<ClusterEvent>, dispatcher: &dyn Dispatcher) {
    let mut pending = Vec::new();
    while let Ok(event) = rx.try_recv() {
        pending.push(event);
    }
    if pending.is_empty() {
        return;
    }

    tracing::info!("Flushing {} queued event(s) before shutdown", pending.len());
    let flush = async {
        for event in &pending {
            // One attempt each; the deadline bounds the whole flush.
            let _ = dispatcher.deliver(event).await;
        }
    };
    if tokio::time::timeout(FLUSH_DEADLINE, flush).await.is_err() {
        tracing::warn!("Shutdown flush deadline hit, dropping remaining events");
    }
}
