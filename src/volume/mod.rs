//! Host-Path Volumes
//!
//! The binding pipeline for one declared host path:
//!
//! ```text
//! VolumeSpec ─▶ PathTypeValidator ─▶ PathReconciler ─▶ MountBinder
//!                 (one stat)          (create if      (descriptor)
//!                                      allowed)
//!                        └──────── BlockingPool ────────┘
//!                                      │
//!                                      ▼
//!                               VolumeRegistry
//!                     (per-path lock, ref counts, backends)
//! ```

pub mod binder;
pub mod pool;
pub mod reconciler;
pub mod registry;
pub mod types;
pub mod validator;

pub use binder::{MountBinder, MountDescriptor};
pub use pool::{BlockingPool, PoolStatus, WorkerPoolConfig};
pub use reconciler::{PathReconciler, ReconcileOutcome};
pub use registry::{
    Acquired, BackendRegistration, BoundMount, MountState, PathCheck, VolumeRegistry,
};
pub use types::{
    require_absolute, Capability, NodeName, Ownership, PathKey, PathKind, PathType,
    PropagationMode, VolumeSpec, WorkloadClass, WorkloadId,
};
pub use validator::{
    CreateAction, PathTypeValidator, ValidationOutcome, ValidationVerdict,
    DEFAULT_DIRECTORY_MODE, DEFAULT_FILE_MODE,
};
