//! Per-request stream tasks
//!
//! Every REQUEST frame gets one task running the stream state machine:
//! `Pending -> Connecting -> Streaming -> Draining -> Closed`. A watch
//! request lists first (paginated), replays the snapshot as DATA frames,
//! then follows the watch from the listed resource version. A plain request
//! performs a single GET.
//!
//! Invariant: every stream that got past Pending emits exactly one terminal
//! frame - COMPLETE for a finished one-shot, STATUS=Closed otherwise.

use super::frame::{Frame, RequestKey, StreamState, is_watch_query};
use super::upstream::{self, UpstreamError};
use crate::util::Backoff;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const LIST_PAGE_SIZE: u32 = 500;
const WATCH_MAX_ATTEMPTS: u32 = 10;
const ONESHOT_MAX_ATTEMPTS: u32 = 3;

/// How long a frame may wait on the outbound queue before the whole session
/// is declared a slow consumer and torn down.
const SLOW_CONSUMER_DEADLINE: Duration = Duration::from_secs(60);

/// Outbound half of a session, shared by all its streams.
///
/// Sends apply backpressure through the bounded queue; a send that cannot
/// complete within the slow-consumer deadline cancels the session.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
    session: CancellationToken,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Frame>, session: CancellationToken) -> Self {
        Self { tx, session }
    }

    /// Enqueue a frame. Returns false when the session is gone (either
    /// closed or just declared a slow consumer); callers unwind quietly.
    pub async fn send(&self, frame: Frame) -> bool {
        if self.session.is_cancelled() {
            return false;
        }
        match tokio::time::timeout(SLOW_CONSUMER_DEADLINE, self.tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!("Outbound queue stalled for 60s, closing slow consumer session");
                // Best effort only: the queue is full, so the client rarely
                // sees this frame before the socket closes.
                let key = RequestKey {
                    cluster_id: String::new(),
                    path: String::new(),
                    query: String::new(),
                };
                let _ = self.tx.try_send(Frame::status(&key, StreamState::SlowConsumer));
                self.session.cancel();
                false
            }
        }
    }
}

/// Everything one stream task needs.
pub struct StreamTask {
    pub key: RequestKey,
    pub user_id: String,
    pub client: kube::Client,
    pub token: Option<String>,
    pub out: Outbound,
    pub cancel: CancellationToken,
}

impl StreamTask {
    /// Drive the stream to completion. Always emits the terminal frame.
    pub async fn run(self) {
        let watch = is_watch_query(&self.key.query);
        tracing::debug!(
            cluster = %self.key.cluster_id,
            path = %self.key.path,
            user = %self.user_id,
            watch,
            "stream starting"
        );

        let outcome = if watch {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Outcome::Cancelled,
                outcome = self.run_watch() => outcome,
            }
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Outcome::Cancelled,
                outcome = self.run_oneshot() => outcome,
            }
        };

        // Draining: upstream I/O is already torn down (futures dropped);
        // emit the single terminal frame.
        match outcome {
            Outcome::Finished => {
                self.out.send(Frame::complete(&self.key)).await;
            }
            Outcome::Cancelled => {
                self.out
                    .send(Frame::status(&self.key, StreamState::Closed))
                    .await;
            }
            Outcome::Failed(message) => {
                self.out
                    .send(Frame::status_message(
                        &self.key,
                        StreamState::Closed,
                        Some(message),
                    ))
                    .await;
            }
        }
    }

    /// Single GET with bounded retries; DATA once, then COMPLETE.
    async fn run_oneshot(&self) -> Outcome {
        let mut backoff = Backoff::watch();
        loop {
            match upstream::get_text(
                &self.client,
                &self.key.path,
                &self.key.query,
                self.token.as_deref(),
            )
            .await
            {
                Ok(body) => {
                    if !self.out.send(Frame::data(&self.key, body)).await {
                        return Outcome::Cancelled;
                    }
                    return Outcome::Finished;
                }
                Err(UpstreamError::Unauthorized) => return self.unauthorized().await,
                Err(e) if e.is_retriable() && backoff.attempts() + 1 < ONESHOT_MAX_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    tracing::debug!(key = %self.key, "one-shot retry in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Outcome::Failed(e.to_string()),
            }
        }
    }

    /// List-then-watch loop with relist on resource version expiry.
    async fn run_watch(&self) -> Outcome {
        let mut backoff = Backoff::watch();

        if !self
            .out
            .send(Frame::status(&self.key, StreamState::Streaming))
            .await
        {
            return Outcome::Cancelled;
        }

        let mut resource_version = match self.initial_list(&mut backoff).await {
            Ok(Some(rv)) => rv,
            Ok(None) => return Outcome::Cancelled,
            Err(outcome) => return outcome,
        };

        loop {
            let stream = match upstream::open_watch(
                &self.client,
                &self.key.path,
                &self.key.query,
                &resource_version,
                self.token.as_deref(),
            )
            .await
            {
                Ok(stream) => stream,
                Err(UpstreamError::Unauthorized) => return self.unauthorized().await,
                Err(UpstreamError::Gone) => {
                    match self.relist_boundary(&mut backoff).await {
                        Ok(Some(rv)) => {
                            resource_version = rv;
                            continue;
                        }
                        Ok(None) => return Outcome::Cancelled,
                        Err(outcome) => return outcome,
                    }
                }
                Err(e) => {
                    match self.reconnect_pause(&mut backoff, &e).await {
                        Some(outcome) => return outcome,
                        None => continue,
                    }
                }
            };

            match self.pump_events(stream, &mut resource_version, &mut backoff).await {
                PumpResult::Relist => match self.relist_boundary(&mut backoff).await {
                    Ok(Some(rv)) => resource_version = rv,
                    Ok(None) => return Outcome::Cancelled,
                    Err(outcome) => return outcome,
                },
                PumpResult::Reconnect(e) => {
                    if let Some(outcome) = self.reconnect_pause(&mut backoff, &e).await {
                        return outcome;
                    }
                }
                PumpResult::SessionGone => return Outcome::Cancelled,
                PumpResult::Unauthorized => return self.unauthorized().await,
            }
        }
    }

    /// Paginated initial list: emits each item as DATA, returns the list
    /// resource version. `Ok(None)` means the session went away mid-replay.
    async fn initial_list(&self, backoff: &mut Backoff) -> Result<Option<String>, Outcome> {
        loop {
            match self.list_snapshot().await {
                Ok(Some(rv)) => return Ok(Some(rv)),
                Ok(None) => return Ok(None),
                Err(UpstreamError::Unauthorized) => return Err(self.unauthorized().await),
                Err(e) if e.is_retriable() && backoff.attempts() < WATCH_MAX_ATTEMPTS => {
                    match self.reconnect_pause(backoff, &e).await {
                        Some(outcome) => return Err(outcome),
                        None => continue,
                    }
                }
                Err(e) => return Err(Outcome::Failed(e.to_string())),
            }
        }
    }

    /// One full paginated list pass. `Ok(None)` when the session vanished.
    async fn list_snapshot(&self) -> Result<Option<String>, UpstreamError> {
        let mut continue_token: Option<String> = None;
        let mut resource_version = "0".to_string();

        loop {
            let page = upstream::list_page(
                &self.client,
                &self.key.path,
                &self.key.query,
                LIST_PAGE_SIZE,
                continue_token.as_deref(),
                self.token.as_deref(),
            )
            .await?;

            for item in page.items {
                if !self.out.send(Frame::data(&self.key, item.to_string())).await {
                    return Ok(None);
                }
            }
            if let Some(rv) = page.resource_version {
                resource_version = rv;
            }

            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => return Ok(Some(resource_version)),
            }
        }
    }

    /// Resource version rolled over: mark the boundary with COMPLETE so the
    /// client can reconcile, then replay a fresh snapshot.
    async fn relist_boundary(&self, backoff: &mut Backoff) -> Result<Option<String>, Outcome> {
        if !self
            .out
            .send(Frame::status_message(
                &self.key,
                StreamState::Reconnecting,
                Some("resource version expired".to_string()),
            ))
            .await
        {
            return Ok(None);
        }
        if !self.out.send(Frame::complete(&self.key)).await {
            return Ok(None);
        }
        let rv = self.initial_list(backoff).await?;
        backoff.reset();
        Ok(rv)
    }

    /// Forward events until the watch ends. Updates `resource_version` from
    /// every event so reconnects resume where they left off.
    async fn pump_events(
        &self,
        stream: impl futures::Stream<Item = Result<String, UpstreamError>>,
        resource_version: &mut String,
        backoff: &mut Backoff,
    ) -> PumpResult {
        use futures::StreamExt;
        let mut stream = std::pin::pin!(stream);

        while let Some(line) = stream.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => return PumpResult::Reconnect(e),
            };

            let event: serde_json::Value = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(key = %self.key, "undecodable watch event: {}", e);
                    if !self
                        .out
                        .send(Frame::status_message(
                            &self.key,
                            StreamState::Warning,
                            Some(format!("undecodable event: {}", e)),
                        ))
                        .await
                    {
                        return PumpResult::SessionGone;
                    }
                    continue;
                }
            };

            let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let object = event.get("object");

            if let Some(rv) = object
                .and_then(|o| o.get("metadata"))
                .and_then(|m| m.get("resourceVersion"))
                .and_then(|v| v.as_str())
            {
                *resource_version = rv.to_string();
            }

            match event_type {
                "BOOKMARK" => continue,
                "ERROR" => {
                    let code = object.and_then(|o| o.get("code")).and_then(|c| c.as_u64());
                    if code == Some(410) {
                        return PumpResult::Relist;
                    }
                    if code == Some(401) || code == Some(403) {
                        return PumpResult::Unauthorized;
                    }
                    return PumpResult::Reconnect(UpstreamError::Transient(format!(
                        "watch error event: {}",
                        line
                    )));
                }
                _ => {
                    backoff.reset();
                    if !self.out.send(Frame::data(&self.key, line)).await {
                        return PumpResult::SessionGone;
                    }
                }
            }
        }

        // Server closed the watch (timeout rollover); reconnect quietly.
        PumpResult::Reconnect(UpstreamError::Transient("watch stream ended".to_string()))
    }

    /// Backoff pause between reconnect attempts. `Some(outcome)` ends the
    /// stream, `None` means try again.
    async fn reconnect_pause(&self, backoff: &mut Backoff, error: &UpstreamError) -> Option<Outcome> {
        if backoff.attempts() >= WATCH_MAX_ATTEMPTS {
            return Some(Outcome::Failed(format!(
                "giving up after {} attempts: {}",
                backoff.attempts(),
                error
            )));
        }
        if !self
            .out
            .send(Frame::status_message(
                &self.key,
                StreamState::Reconnecting,
                Some(error.to_string()),
            ))
            .await
        {
            return Some(Outcome::Cancelled);
        }
        let delay = backoff.next_delay();
        tracing::debug!(key = %self.key, "reconnecting in {:?}: {}", delay, error);
        tokio::time::sleep(delay).await;
        None
    }

    /// Upstream rejected our credentials; never retried.
    async fn unauthorized(&self) -> Outcome {
        self.out
            .send(Frame::status(&self.key, StreamState::Unauthorized))
            .await;
        Outcome::Failed("unauthorized".to_string())
    }
}

enum Outcome {
    /// One-shot finished; terminal frame is COMPLETE
    Finished,
    /// Cancelled (CLOSE frame or session teardown); terminal is STATUS=Closed
    Cancelled,
    /// Errored out; terminal is STATUS=Closed with a message
    Failed(String),
}

enum PumpResult {
    Relist,
    Reconnect(UpstreamError),
    SessionGone,
    Unauthorized,
}

/// Handle kept by the session for one live stream.
pub struct StreamHandle {
    pub cancel: CancellationToken,
    pub task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// Spawn the stream task.
    pub fn spawn(task: StreamTask) -> Self {
        let cancel = task.cancel.clone();
        let handle = tokio::spawn(task.run());
        Self { cancel, task: handle }
    }
}
