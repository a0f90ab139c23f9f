//! Controller module
//!
//! The per-node reconciliation loop that turns scheduler binding decisions
//! into bound volumes, and the backoff policy it retries with.

pub mod backoff;
pub mod reconcile_loop;

pub use backoff::Backoff;
pub use reconcile_loop::{
    BindingRequest, ReconcileLoop, ReconcileLoopConfig, VolumeRequest, WorkloadStatus,
};
