//! hostbind - Node-Local Host-Path Volume Engine
//!
//! Validates, creates and tracks host filesystem paths bound into workloads
//! on one node, and discovers plugin storage backends that register over
//! local sockets.
//!
//! # Architecture
//!
//! ```text
//!  scheduler ──▶ ReconcileLoop ──▶ VolumeRegistry ◀── PluginRegistrar ◀── backend sockets
//!                  (retry,            │    ▲
//!                   backoff)          ▼    │
//!                        PathTypeValidator → PathReconciler → MountBinder
//!                                     (BlockingPool + watchdog)
//! ```
//!
//! The loop and the registrar never talk to each other directly; the
//! registry is the only shared state.
//!
//! # Modules
//!
//! - [`adapters`] - Host filesystem, socket transport and event sinks
//! - [`api`] - HTTP API of the node agent
//! - [`controller`] - Reconciliation loop and retry backoff
//! - [`domain`] - Ports and domain events
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`plugin`] - Plugin socket protocol and registrar
//! - [`status`] - Read-only node status snapshot
//! - [`volume`] - Validation, creation, binding and the registry

pub mod adapters;
pub mod api;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod plugin;
pub mod status;
pub mod volume;

// Re-export commonly used types
pub use controller::{BindingRequest, ReconcileLoop, ReconcileLoopConfig, VolumeRequest, WorkloadStatus};
pub use error::{Error, Result};
pub use plugin::{PluginRegistrar, RegistrarConfig};
pub use status::{NodeStatus, Readiness};
pub use volume::{
    MountDescriptor, PathType, PropagationMode, VolumeRegistry, VolumeSpec, WorkerPoolConfig,
};
