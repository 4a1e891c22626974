//! Kubeconfig source watching
//!
//! Each watched path (file or directory) gets a background task that reloads
//! the whole source after the file system quiesces for 250ms. The reload is
//! coarse: every context from that origin is replaced, which keeps the
//! semantics simple when files are rewritten, truncated, or swapped by
//! editors. A vanished path evicts its contexts.

use super::{ContextSource, ContextStore};
use crate::util::Backoff;
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEBOUNCE_QUIESCENCE: Duration = Duration::from_millis(250);
const WATCHER_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Watch `path` and keep the store's contexts for it current.
///
/// The path is loaded once up front; load errors are logged and retried on
/// the next change rather than failing the daemon.
pub fn watch_files(
    store: Arc<ContextStore>,
    path: PathBuf,
    source: ContextSource,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match store.load_path(&path, source) {
            Ok(added) => {
                tracing::info!("Loaded {} context(s) from {}", added.len(), path.display())
            }
            Err(e) => tracing::warn!("Initial load of {} failed: {}", path.display(), e),
        }

        let mut backoff = Backoff::new(Duration::from_millis(500), WATCHER_BACKOFF_CAP);
        while !token.is_cancelled() {
            match run_watch_loop(&store, &path, source, &token).await {
                Ok(()) => break, // cancelled
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "File watcher for {} failed: {}, retrying in {:?}",
                        path.display(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    })
}

/// One watcher incarnation: runs until cancellation (Ok) or a watcher error
/// that warrants a rebuild (Err).
async fn run_watch_loop(
    store: &ContextStore,
    path: &PathBuf,
    source: ContextSource,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;

    // Watch the parent for plain files so atomic-rename saves are seen.
    let (watch_target, mode) = if path.is_dir() {
        (path.clone(), RecursiveMode::Recursive)
    } else {
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| path.clone());
        (parent, RecursiveMode::NonRecursive)
    };
    watcher.watch(&watch_target, mode)?;

    loop {
        let first = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = rx.recv() => event,
        };

        let Some(first) = first else {
            anyhow::bail!("watch channel closed");
        };
        if !is_relevant(path, &first?) {
            continue;
        }

        // Debounce: wait for quiescence before reloading.
        loop {
            match tokio::time::timeout(DEBOUNCE_QUIESCENCE, rx.recv()).await {
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => anyhow::bail!("watch channel closed"),
                Err(_) => break, // quiescent
            }
        }

        if token.is_cancelled() {
            return Ok(());
        }

        if path.exists() {
            let origin = path.to_string_lossy().to_string();
            match store.load_path(path, source) {
                Ok(added) => tracing::info!(
                    "Reloaded {}: {} context(s) now registered",
                    path.display(),
                    added.len()
                ),
                Err(e) => {
                    // Keep prior state; a half-written file should not wipe
                    // the registry.
                    tracing::warn!("Reload of {} failed, keeping prior contexts: {}", origin, e);
                }
            }
        } else {
            let origin = path.to_string_lossy().to_string();
            let removed = store.remove_origin(&origin);
            tracing::info!(
                "{} removed, evicted {} context(s)",
                path.display(),
                removed
            );
        }
    }
}

/// Filter out parent-directory noise when watching a single file.
fn is_relevant(path: &PathBuf, event: &notify::Event) -> bool {
    if path.is_dir() {
        return true;
    }
    event.paths.is_empty() || event.paths.iter().any(|p| p == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
clusters:
  - name: cluster-a
    cluster:
      server: https://a.example.com:6443
users:
  - name: user-a
    user:
      token: secret-a
contexts:
  - name: ctxA
    context:
      cluster: cluster-a
      user: user-a
"#;

    async fn wait_for<F: Fn() -> bool>(cond: F, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_modification_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kc.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = Arc::new(ContextStore::new());
        let token = CancellationToken::new();
        let handle = watch_files(
            store.clone(),
            path.clone(),
            ContextSource::Primary,
            token.clone(),
        );

        assert!(
            wait_for(|| store.get("ctxA").is_some(), Duration::from_secs(2)).await,
            "initial load should register ctxA"
        );

        // Append a second context and save.
        let second = SAMPLE.replace("ctxA", "ctxB");
        std::fs::write(&path, format!("{}\n---\n{}", SAMPLE, second)).unwrap();

        assert!(
            wait_for(
                || store.get("ctxA").is_some() && store.get("ctxB").is_some(),
                Duration::from_secs(2)
            )
            .await,
            "reload should register both contexts within the deadline"
        );

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_removal_evicts_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kc.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = Arc::new(ContextStore::new());
        let token = CancellationToken::new();
        let handle = watch_files(
            store.clone(),
            path.clone(),
            ContextSource::ExternalPath,
            token.clone(),
        );

        assert!(wait_for(|| store.get("ctxA").is_some(), Duration::from_secs(2)).await);

        std::fs::remove_file(&path).unwrap();

        assert!(
            wait_for(|| store.get("ctxA").is_none(), Duration::from_secs(2)).await,
            "contexts from a removed file should be evicted"
        );

        token.cancel();
        let _ = handle.await;
    }
}
