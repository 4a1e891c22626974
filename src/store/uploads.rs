//! Uploaded kubeconfig handling
//!
//! Inline uploads are validated, persisted atomically under the daemon's
//! uploads directory (write to a temp file, fsync, rename), and registered
//! as `Uploaded` contexts. A sidecar metadata file records the upload time
//! and TTL so expiry survives a daemon restart without being extended by it.

use super::{split_contexts, ContextSource, ContextStore, StoreError};
use crate::config::paths;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sweep twice a second so expiry lands well inside the 1s tolerance.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadMeta {
    uploaded_at: DateTime<Utc>,
    ttl_secs: u64,
}

impl UploadMeta {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl_secs == 0 {
            None
        } else {
            Some(self.uploaded_at + ChronoDuration::seconds(self.ttl_secs as i64))
        }
    }
}

/// Accept inline kubeconfig content and register it as an `Uploaded` source.
///
/// A TTL of 0 means no expiry. Re-uploading under the same `source_name`
/// replaces the prior content and re-arms the TTL. Returns the registered
/// context names.
pub fn upload_raw(
    store: &ContextStore,
    content: &str,
    source_name: &str,
    ttl_secs: u64,
) -> Result<Vec<String>, StoreError> {
    let kubeconfig =
        Kubeconfig::from_yaml(content).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
    if kubeconfig.contexts.is_empty() {
        return Err(StoreError::InvalidConfig(
            "kubeconfig contains no contexts".to_string(),
        ));
    }

    let target = paths::upload_path(source_name);
    persist_atomically(&target, content)?;

    let meta = UploadMeta {
        uploaded_at: Utc::now(),
        ttl_secs,
    };
    let meta_json = serde_json::to_string(&meta).expect("upload meta serializes");
    persist_atomically(&meta_path(&target), &meta_json)?;

    let origin = target.to_string_lossy().to_string();
    let contexts = split_contexts(
        &kubeconfig,
        ContextSource::Uploaded,
        &origin,
        meta.expires_at(),
    );
    Ok(store.replace_origin(&origin, contexts))
}

/// Validate kubeconfig content without registering anything.
///
/// Returns the number of contexts found.
pub fn validate_raw(content: &str) -> Result<usize, StoreError> {
    let kubeconfig =
        Kubeconfig::from_yaml(content).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
    Ok(kubeconfig.contexts.len())
}

/// Re-register every persisted upload at startup.
///
/// Uploads whose TTL already lapsed while the daemon was down are deleted
/// instead of registered.
pub fn reload_persisted_uploads(store: &ContextStore) -> usize {
    let dir = paths::uploads_dir();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return 0;
    };

    let mut registered = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }

        let meta = read_meta(&path);
        if let Some(deadline) = meta.as_ref().and_then(UploadMeta::expires_at) {
            if deadline <= Utc::now() {
                tracing::info!("Dropping expired upload {}", path.display());
                remove_upload_files(&path);
                continue;
            }
        }

        let kubeconfig = match Kubeconfig::read_from(&path) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("Skipping unreadable upload {}: {}", path.display(), e);
                continue;
            }
        };

        let origin = path.to_string_lossy().to_string();
        let contexts = split_contexts(
            &kubeconfig,
            ContextSource::Uploaded,
            &origin,
            meta.as_ref().and_then(UploadMeta::expires_at),
        );
        registered += store.replace_origin(&origin, contexts).len();
    }
    registered
}

/// Periodically evict expired uploaded contexts and delete their files.
pub fn spawn_ttl_sweeper(store: Arc<ContextStore>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            for context in store.evict_expired() {
                tracing::info!("Context '{}' expired, evicted", context.name);
                let origin = Path::new(&context.origin);
                if origin.starts_with(paths::uploads_dir()) {
                    remove_upload_files(origin);
                }
            }
        }
    })
}

/// Write content to `target` atomically: temp file in the same directory,
/// fsync, then rename over the destination.
fn persist_atomically(target: &Path, content: &str) -> Result<(), StoreError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |e: std::io::Error| StoreError::Io {
        path: target.display().to_string(),
        source: e,
    };

    paths::ensure_dir(dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(target).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn meta_path(upload: &Path) -> std::path::PathBuf {
    upload.with_extension("meta.json")
}

fn read_meta(upload: &Path) -> Option<UploadMeta> {
    let contents = std::fs::read_to_string(meta_path(upload)).ok()?;
    serde_json::from_str(&contents).ok()
}

fn remove_upload_files(upload: &Path) {
    let _ = std::fs::remove_file(upload);
    let _ = std::fs::remove_file(meta_path(upload));
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

    // Serializes tests that redirect AGENTKUBE_DIR.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_home<R>(f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: guarded by ENV_LOCK so concurrent tests never race on the
        // environment; restored before the lock is released.
        unsafe {
            std::env::set_var("AGENTKUBE_DIR", dir.path());
        }
        let result = f();
        unsafe {
            std::env::remove_var("AGENTKUBE_DIR");
        }
        result
    }

    #[test]
    fn test_upload_registers_and_persists() {
        with_home(|| {
            let store = ContextStore::new();
            let added = upload_raw(&store, SAMPLE, "staging", 0).unwrap();
            assert_eq!(added, vec!["ctxA"]);
            assert!(paths::upload_path("staging").exists());
            assert!(store.get("ctxA").is_some());
        });
    }

    #[test]
    fn test_upload_same_source_replaces() {
        with_home(|| {
            let store = ContextStore::new();
            upload_raw(&store, SAMPLE, "staging", 0).unwrap();
            let again = upload_raw(&store, SAMPLE, "staging", 0).unwrap();
            assert_eq!(again, vec!["ctxA"]);
            assert_eq!(store.list().len(), 1, "no duplicates on re-upload");
        });
    }

    #[test]
    fn test_upload_rejects_invalid_content() {
        with_home(|| {
            let store = ContextStore::new();
            let err = upload_raw(&store, "not: [ valid kubeconfig", "bad", 0).unwrap_err();
            assert!(matches!(err, StoreError::InvalidConfig(_)));
            assert!(store.list().is_empty());
        });
    }

    #[test]
    fn test_upload_without_contexts_rejected() {
        with_home(|| {
            let store = ContextStore::new();
            let err = upload_raw(&store, "clusters: []", "empty", 0).unwrap_err();
            assert!(matches!(err, StoreError::InvalidConfig(_)));
        });
    }

    #[test]
    fn test_validate_counts_contexts() {
        assert_eq!(validate_raw(SAMPLE).unwrap(), 1);
        assert!(validate_raw("{{{").is_err());
    }

    #[test]
    fn test_reload_persisted_uploads_survives_restart() {
        with_home(|| {
            let store = ContextStore::new();
            upload_raw(&store, SAMPLE, "staging", 0).unwrap();

            // Simulate a restart with a fresh store.
            let fresh = ContextStore::new();
            let registered = reload_persisted_uploads(&fresh);
            assert_eq!(registered, 1);
            assert!(fresh.get("ctxA").is_some());
        });
    }

    #[test]
    fn test_reload_drops_lapsed_ttl() {
        with_home(|| {
            let store = ContextStore::new();
            upload_raw(&store, SAMPLE, "shortlived", 1).unwrap();

            // Backdate the metadata so the TTL has already lapsed.
            let target = paths::upload_path("shortlived");
            let meta = UploadMeta {
                uploaded_at: Utc::now() - ChronoDuration::seconds(5),
                ttl_secs: 1,
            };
            std::fs::write(meta_path(&target), serde_json::to_string(&meta).unwrap()).unwrap();

            let fresh = ContextStore::new();
            assert_eq!(reload_persisted_uploads(&fresh), 0);
            assert!(!target.exists(), "expired upload file is deleted");
        });
    }

    #[tokio::test]
    async fn test_ttl_sweeper_evicts_within_tolerance() {
        let (store, origin_dir) = {
            let _guard = ENV_LOCK.lock().unwrap();
            let dir = tempfile::tempdir().unwrap();
            unsafe {
                std::env::set_var("AGENTKUBE_DIR", dir.path());
            }
            let store = Arc::new(ContextStore::new());
            upload_raw(&store, SAMPLE, "blip", 1).unwrap();
            unsafe {
                std::env::remove_var("AGENTKUBE_DIR");
            }
            (store, dir)
        };

        let token = CancellationToken::new();
        let handle = spawn_ttl_sweeper(store.clone(), token.clone());

        assert!(store.get("ctxA").is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(
            store.get("ctxA").is_none(),
            "ttl=1s context must be gone within tolerance"
        );

        token.cancel();
        let _ = handle.await;
        drop(origin_dir);
    }
}
