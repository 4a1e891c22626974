//! Daemon configuration
//!
//! Three layers, each optional past the CLI:
//! - CLI flags (listen address, primary kubeconfig, in-cluster mode)
//! - `settings.json` in the daemon home (external kubeconfig paths, scans)
//! - `watcher.yaml` in the daemon home (cluster watcher + dispatcher)

pub mod loader;
pub mod paths;
pub mod schema;

pub use loader::*;
pub use paths::*;
pub use schema::*;
