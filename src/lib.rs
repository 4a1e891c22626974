//! Agentkube daemon library
//!
//! Core subsystems of the multi-cluster operator daemon:
//! - [`store`]: the context registry aggregating kubeconfig sources
//! - [`mux`]: the per-client WebSocket watch multiplexer
//! - [`portforward`]: the tunnel registry
//! - [`watcher`]: per-cluster informers and event dispatch
//! - [`server`]: the REST/WebSocket surface gluing them together
//!
//! The binary wires these up; everything is usable as a library, which is
//! how the integration tests drive it.

pub mod cli;
pub mod config;
pub mod mux;
pub mod portforward;
pub mod server;
pub mod store;
pub mod util;
pub mod watcher;

// Re-export commonly used types for convenience
pub use config::{Settings, WatcherConfig};
pub use mux::{Frame, FrameType, MuxSession, RequestKey, StreamState};
pub use portforward::{ForwardRequest, ForwardStatus, PortForward, PortForwardRegistry};
pub use store::{ClusterContext, ContextSource, ContextStore};
pub use watcher::{ClusterEvent, ClusterWatcher, Dispatcher, EventPhase};
