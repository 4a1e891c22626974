//! Agentkube - local multi-cluster Kubernetes operator daemon
//!
//! Aggregates kubeconfig sources into a context store, serves REST and
//! WebSocket traffic for frontends, manages port-forward tunnels, and
//! dispatches cluster events to configured sinks.

mod cli;
mod config;
mod mux;
mod portforward;
mod server;
mod store;
mod util;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    cli::init_logging(args.debug);

    // Startup config errors are fatal; runtime reload errors are not.
    let settings = config::load_settings().context("Failed to load settings")?;
    let watcher_config = config::load_watcher_config().context("Failed to load watcher config")?;

    let shutdown = util::Shutdown::new();
    shutdown.listen_for_signals();

    let store = Arc::new(store::ContextStore::new());

    // Primary source: in-cluster service account or a kubeconfig file.
    if args.in_cluster {
        match store::in_cluster_context() {
            Some(context) => {
                store.replace_origin("in-cluster", vec![context]);
                tracing::info!("Registered in-cluster context");
            }
            None => anyhow::bail!("--in-cluster set but no service account environment found"),
        }
    } else if let Some(path) = args.primary_kubeconfig() {
        match store.load_path(&path, store::ContextSource::Primary) {
            Ok(added) => tracing::info!(
                "Loaded {} context(s) from primary kubeconfig {}",
                added.len(),
                path.display()
            ),
            Err(e) => tracing::warn!("Primary kubeconfig {} not loaded: {}", path.display(), e),
        }
        let _ = store::watch_files(
            store.clone(),
            path,
            store::ContextSource::Primary,
            shutdown.child(),
        );
    }

    // External sources from settings.json; each path is watched.
    for external in &settings.kubeconfig.external_paths {
        let path = std::path::PathBuf::from(external);
        let _ = store::watch_files(
            store.clone(),
            path,
            store::ContextSource::ExternalPath,
            shutdown.child(),
        );
    }

    // Uploads persisted by earlier runs come back, then TTLs are enforced.
    let reloaded = store::reload_persisted_uploads(&store);
    if reloaded > 0 {
        tracing::info!("Restored {} uploaded context(s)", reloaded);
    }
    let _ = store::spawn_ttl_sweeper(store.clone(), shutdown.child());

    if settings.image_scans.enable {
        tracing::info!("Image scan integration enabled (handled outside the control plane)");
    }

    let forwards = Arc::new(portforward::PortForwardRegistry::new(store.clone()));

    let mut cluster_watcher =
        watcher::ClusterWatcher::new(watcher_config, store.clone(), shutdown.child());
    cluster_watcher.start().await?;

    let state = server::AppState {
        store: store.clone(),
        forwards: forwards.clone(),
        shutdown: shutdown.child(),
    };
    let app = server::build_router(state);

    let bind_addr = format!("{}:{}", args.listen_addr, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Listening on {}", bind_addr);

    let drain = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.triggered().await })
        .await
        .context("HTTP server failed")?;

    // Shutdown order: watcher flushes its queues, then tunnels close.
    tracing::info!("Shutting down");
    cluster_watcher.stop().await;
    forwards.stop_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
