//! Multi-network CNI meta-plugin for Kubernetes
//!
//! This implementation attaches a pod to several networks at once:
//! - A thin shim binary forwards each CNI invocation to a long-running daemon
//! - The daemon resolves the pod's network selection into delegate configurations
//! - Delegate plugins run in order, with rollback of earlier ones when a later one fails
//! - Per-delegate results merge into one CNI result with a single default route

pub mod attachment;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod readiness;
pub mod resolver;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use commands::run_cni;
pub use config::{DaemonConfig, NetConf};
pub use engine::DelegationEngine;
pub use error::{Error, Result};
pub use types::{CniResult, Command, InvocationContext};
