//! Graceful shutdown plumbing
//!
//! The daemon owns a root [`CancellationToken`]; every subsystem receives a
//! child token and every task it spawns a grandchild. Cancelling the root
//! propagates down the whole tree.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Root shutdown handle for the daemon.
#[derive(Clone, Debug)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Child token for a subsystem. Cancelled when the root cancels.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger shutdown of the whole tree.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Trigger on SIGINT or SIGTERM. Spawned once at startup.
    pub fn listen_for_signals(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut sigterm =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::error!("Failed to install SIGTERM handler: {}", e);
                            let _ = ctrl_c.await;
                            token.cancel();
                            return;
                        }
                    };
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                tracing::info!("Received interrupt, shutting down");
            }

            token.cancel();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Await a set of join handles, abandoning whatever is still running once the
/// deadline passes.
pub async fn join_with_deadline(
    handles: Vec<tokio::task::JoinHandle<()>>,
    deadline: Duration,
) -> bool {
    let join_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    tokio::time::timeout(deadline, join_all).await.is_ok()
}
