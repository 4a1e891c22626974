//! CLI argument handling

mod logging;

pub use logging::*;

use clap::Parser;
use std::path::PathBuf;

/// Multi-cluster Kubernetes operator daemon
#[derive(Parser, Debug)]
#[command(name = "agentkube")]
#[command(about = "Aggregates kubeconfig sources and proxies REST, watch, and port-forward traffic", long_about = None)]
pub struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8751)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// Path to the primary kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Use the in-cluster service account instead of a kubeconfig
    #[arg(long)]
    pub in_cluster: bool,

    /// Enable debug logging
    #[arg(long, short = 'd')]
    pub debug: bool,
}

impl Args {
    /// Resolve the primary kubeconfig path: flag, then KUBECONFIG, then
    /// `~/.kube/config`.
    pub fn primary_kubeconfig(&self) -> Option<PathBuf> {
        if let Some(path) = &self.kubeconfig {
            return Some(path.clone());
        }
        if let Ok(env) = std::env::var("KUBECONFIG") {
            // KUBECONFIG may be a path list; each entry is its own source,
            // but the first is treated as primary.
            if let Some(first) = std::env::split_paths(&env).next() {
                return Some(first);
            }
        }
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".kube").join("config"))
    }
}
