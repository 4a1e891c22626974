//! REST client cache
//!
//! One `kube::Client` per context, built lazily from the context's minimized
//! kubeconfig. A per-name slot acts as a single-flight guard: concurrent
//! cache misses for the same context build one client, not several. Slots
//! are dropped whenever the store replaces or removes the context, so a
//! reload atomically invalidates the binding.

use super::{ClusterContext, StoreError};
use kube::config::KubeConfigOptions;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<kube::Client>>;

pub struct ClientCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached client for a context, building it on first use.
    pub async fn get_or_build(&self, context: &ClusterContext) -> Result<kube::Client, StoreError> {
        let slot = {
            let mut slots = self.slots.lock().expect("client cache lock poisoned");
            slots
                .entry(context.name.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        slot.get_or_try_init(|| build_client(context))
            .await
            .cloned()
    }

    /// Drop the cached client for a context. The next `get_or_build` builds
    /// a fresh one from whatever record the store holds then.
    pub fn invalidate(&self, name: &str) {
        self.slots
            .lock()
            .expect("client cache lock poisoned")
            .remove(name);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn build_client(context: &ClusterContext) -> Result<kube::Client, StoreError> {
    let config =
        kube::Config::from_custom_kubeconfig(context.raw.clone(), &KubeConfigOptions::default())
            .await
            .map_err(|e| StoreError::ClientBuild {
                context: context.name.clone(),
                message: e.to_string(),
            })?;

    kube::Client::try_from(config).map_err(|e| StoreError::ClientBuild {
        context: context.name.clone(),
        message: e.to_string(),
    })
}
