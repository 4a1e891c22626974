//! Context store
//!
//! The authoritative registry of known clusters. Contexts are aggregated
//! from the primary kubeconfig, external paths, uploads, and dynamic
//! registrations; file-backed sources are kept current by [`files`].
//!
//! Reads are lock-free in practice: the map lives behind a copy-on-write
//! `Arc`, so `list`/`get` clone a pointer and never wait on writers.

mod clients;
mod context;
mod files;
mod uploads;

pub use clients::*;
pub use context::*;
pub use files::*;
pub use uploads::*;

use chrono::Utc;
use kube::config::Kubeconfig;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Context store failure kinds.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid kubeconfig: {0}")]
    InvalidConfig(String),

    #[error("unknown cluster context: {0}")]
    UnknownContext(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build client for {context}: {message}")]
    ClientBuild { context: String, message: String },
}

type ContextMap = HashMap<String, Arc<ClusterContext>>;

/// The authoritative, concurrently readable set of cluster contexts.
pub struct ContextStore {
    inner: RwLock<Arc<ContextMap>>,
    clients: ClientCache,
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
            clients: ClientCache::new(),
        }
    }

    /// Parse a kubeconfig file (or every kubeconfig in a directory) and
    /// register its contexts under `source`.
    ///
    /// The whole path acts as one source: a later reload replaces everything
    /// previously registered from it. Returns the registered context names.
    pub fn load_path(&self, path: &Path, source: ContextSource) -> Result<Vec<String>, StoreError> {
        let origin = path.to_string_lossy().to_string();
        let kubeconfig = read_kubeconfig_path(path)?;
        let contexts = split_contexts(&kubeconfig, source, &origin, None);
        Ok(self.replace_origin(&origin, contexts))
    }

    /// Register pre-built contexts, replacing everything that previously
    /// came from the same origin. Returns the names as registered (after any
    /// collision disambiguation).
    ///
    /// Entries whose kubeconfig records are byte-identical to the replaced
    /// ones keep their cached REST client.
    pub fn replace_origin(&self, origin: &str, contexts: Vec<ClusterContext>) -> Vec<String> {
        let mut guard = self.inner.write().expect("context store lock poisoned");
        let mut map: ContextMap = (**guard).clone();

        let old_fingerprints: HashMap<String, String> = map
            .values()
            .filter(|c| c.origin == origin)
            .map(|c| (c.name.clone(), c.fingerprint()))
            .collect();

        map.retain(|_, c| c.origin != origin);

        let mut added = Vec::new();
        for mut context in contexts {
            let name = disambiguate_name(&map, &context);
            context.name = name.clone();

            let unchanged = old_fingerprints
                .get(&name)
                .is_some_and(|fp| *fp == context.fingerprint());
            if !unchanged {
                self.clients.invalidate(&name);
            }

            map.insert(name.clone(), Arc::new(context));
            added.push(name);
        }

        // Entries that existed for this origin but were not re-registered
        // lose their clients too.
        for name in old_fingerprints.keys() {
            if !map.contains_key(name) {
                self.clients.invalidate(name);
            }
        }

        *guard = Arc::new(map);
        added.sort();
        added
    }

    /// Drop every context registered from `origin`.
    pub fn remove_origin(&self, origin: &str) -> usize {
        let mut guard = self.inner.write().expect("context store lock poisoned");
        let mut map: ContextMap = (**guard).clone();

        let removed: Vec<String> = map
            .values()
            .filter(|c| c.origin == origin)
            .map(|c| c.name.clone())
            .collect();
        for name in &removed {
            map.remove(name);
            self.clients.invalidate(name);
        }

        *guard = Arc::new(map);
        removed.len()
    }

    /// Drop every context registered under `source`.
    pub fn remove_source(&self, source: ContextSource) -> usize {
        let mut guard = self.inner.write().expect("context store lock poisoned");
        let mut map: ContextMap = (**guard).clone();

        let removed: Vec<String> = map
            .values()
            .filter(|c| c.source == source)
            .map(|c| c.name.clone())
            .collect();
        for name in &removed {
            map.remove(name);
            self.clients.invalidate(name);
        }

        *guard = Arc::new(map);
        removed.len()
    }

    /// Remove a single context by name.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.inner.write().expect("context store lock poisoned");
        let mut map: ContextMap = (**guard).clone();
        let existed = map.remove(name).is_some();
        if existed {
            self.clients.invalidate(name);
            *guard = Arc::new(map);
        }
        existed
    }

    /// Immutable snapshot of one context.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterContext>> {
        self.snapshot().get(name).cloned()
    }

    /// Immutable snapshot of all contexts, sorted by name.
    pub fn list(&self) -> Vec<Arc<ClusterContext>> {
        let snapshot = self.snapshot();
        let mut contexts: Vec<_> = snapshot.values().cloned().collect();
        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        contexts
    }

    /// Cached REST client for a context; built on first use.
    pub async fn client(&self, name: &str) -> Result<kube::Client, StoreError> {
        let context = self
            .get(name)
            .ok_or_else(|| StoreError::UnknownContext(name.to_string()))?;
        self.clients.get_or_build(&context).await
    }

    /// Evict contexts whose TTL deadline has passed. Returns the evicted
    /// records so callers can clean up backing files.
    pub fn evict_expired(&self) -> Vec<Arc<ClusterContext>> {
        let now = Utc::now();
        let has_expired = self.snapshot().values().any(|c| c.is_expired(now));
        if !has_expired {
            return Vec::new();
        }

        let mut guard = self.inner.write().expect("context store lock poisoned");
        let mut map: ContextMap = (**guard).clone();
        let expired: Vec<Arc<ClusterContext>> = map
            .values()
            .filter(|c| c.is_expired(now))
            .cloned()
            .collect();
        for context in &expired {
            map.remove(&context.name);
            self.clients.invalidate(&context.name);
        }
        *guard = Arc::new(map);
        expired
    }

    fn snapshot(&self) -> Arc<ContextMap> {
        self.inner
            .read()
            .expect("context store lock poisoned")
            .clone()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("contexts", &self.snapshot().len())
            .finish()
    }
}

/// Pick a store-unique name for a context. The bare name wins when free or
/// when it is a same-origin replacement; collisions from a different source
/// get a source-tag prefix, then a numeric suffix as a last resort.
fn disambiguate_name(map: &ContextMap, context: &ClusterContext) -> String {
    let free = |candidate: &str| match map.get(candidate) {
        None => true,
        Some(existing) => existing.origin == context.origin,
    };

    if free(&context.name) {
        return context.name.clone();
    }

    let tagged = format!("{}:{}", context.source.tag(), context.name);
    if free(&tagged) {
        return tagged;
    }

    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", tagged, n);
        if free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Read a kubeconfig file, or merge every kubeconfig found in a directory.
fn read_kubeconfig_path(path: &Path) -> Result<Kubeconfig, StoreError> {
    if path.is_dir() {
        let mut merged = Kubeconfig::default();
        let entries = std::fs::read_dir(path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_kubeconfig_file(p))
            .collect();
        files.sort();

        for file in files {
            let kubeconfig = Kubeconfig::read_from(&file)
                .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
            merged = merged
                .merge(kubeconfig)
                .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        }
        Ok(merged)
    } else {
        Kubeconfig::read_from(path).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }
}

fn is_kubeconfig_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => true,
        Some(_) => false,
        // kubeconfigs are conventionally extensionless (`~/.kube/config`)
        None => true,
    }
}
