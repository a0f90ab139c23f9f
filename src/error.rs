//! Error types for the HostBind volume engine

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::volume::{PathKind, PathType};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the HostBind volume engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Path is not usable (relative, empty, ...)
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Existing path has a different kind than declared
    #[error("Type mismatch for {path:?}: expected {expected}, found {actual}")]
    TypeMismatch {
        path: PathBuf,
        expected: PathKind,
        actual: PathKind,
    },

    /// Path does not exist and the declared type does not allow creating it
    #[error("Path {path:?} does not exist and type {path_type} does not allow creation")]
    MissingAndNotCreatable { path: PathBuf, path_type: PathType },

    /// Filesystem refused to report on the path
    #[error("Permission denied while inspecting {path:?}")]
    PermissionDenied { path: PathBuf },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Another workload holds the path with a diverging declaration
    #[error("Conflicting binding for {path:?} on node {node}: {reason}")]
    ConflictingBinding {
        node: String,
        path: PathBuf,
        reason: String,
    },

    /// Bidirectional propagation requested by an ordinary workload
    #[error("Propagation mode {mode} is not permitted for workload {workload_id}")]
    PropagationNotPermitted { workload_id: String, mode: String },

    /// Workload is not known to the engine
    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// Filesystem mutation failed; retried by the reconciliation loop
    #[error("Failed to reconcile {path:?}: {reason}")]
    Reconcile { path: PathBuf, reason: String },

    /// Blocking filesystem call exceeded the watchdog threshold
    #[error("{operation} on {path:?} exceeded watchdog threshold ({elapsed:?})")]
    WatchdogTimeout {
        operation: String,
        path: PathBuf,
        elapsed: Duration,
    },

    /// Reconciliation queue is no longer accepting requests
    #[error("Reconciliation queue closed")]
    QueueClosed,

    // =========================================================================
    // Plugin Backend Errors
    // =========================================================================
    /// No registered backend offers the capability
    #[error("No registered backend offers capability {capability}")]
    BackendUnavailable { capability: String },

    /// Binding depends on a backend that went away
    #[error("Binding {path:?} is degraded: backend {backend_id} is not registered")]
    BackendDegraded { backend_id: String, path: PathBuf },

    /// Backend did not answer the handshake in time
    #[error("Handshake with {socket:?} timed out after {timeout:?}")]
    HandshakeTimeout { socket: PathBuf, timeout: Duration },

    /// Backend answered the handshake with something unusable
    #[error("Handshake with {socket:?} failed: {reason}")]
    HandshakeFailed { socket: PathBuf, reason: String },

    /// Backend missed too many liveness probes
    #[error("Backend {backend_id} missed {missed} consecutive heartbeats")]
    HeartbeatMissed { backend_id: String, missed: u32 },
}

impl Error {
    /// Whether the reconciliation loop should retry the bind after backoff.
    ///
    /// Terminal errors need an operator or a manifest change; retrying them
    /// would reproduce the same failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Reconcile { .. }
                | Error::WatchdogTimeout { .. }
                | Error::MissingAndNotCreatable { .. }
                | Error::BackendUnavailable { .. }
                | Error::BackendDegraded { .. }
                | Error::Io(_)
        )
    }

    /// Short machine-readable reason used in status reports and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Serialization(_) => "Serialization",
            Error::Config(_) => "Config",
            Error::Internal(_) => "Internal",
            Error::InvalidPath { .. } => "InvalidPath",
            Error::TypeMismatch { .. } => "TypeMismatch",
            Error::MissingAndNotCreatable { .. } => "MissingAndNotCreatable",
            Error::PermissionDenied { .. } => "PermissionDenied",
            Error::ConflictingBinding { .. } => "ConflictingBinding",
            Error::PropagationNotPermitted { .. } => "PropagationNotPermitted",
            Error::WorkloadNotFound(_) => "WorkloadNotFound",
            Error::Reconcile { .. } => "ReconcileError",
            Error::WatchdogTimeout { .. } => "WatchdogTimeout",
            Error::QueueClosed => "QueueClosed",
            Error::BackendUnavailable { .. } => "BackendUnavailable",
            Error::BackendDegraded { .. } => "BackendDegraded",
            Error::HandshakeTimeout { .. } => "HandshakeTimeout",
            Error::HandshakeFailed { .. } => "HandshakeFailed",
            Error::HeartbeatMissed { .. } => "HeartbeatMissed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let retryable = Error::Reconcile {
            path: PathBuf::from("/data"),
            reason: "read-only filesystem".to_string(),
        };
        assert!(retryable.is_retryable());

        let missing = Error::MissingAndNotCreatable {
            path: PathBuf::from("/data/a"),
            path_type: PathType::Directory,
        };
        assert!(missing.is_retryable());

        let mismatch = Error::TypeMismatch {
            path: PathBuf::from("/data/b"),
            expected: PathKind::Directory,
            actual: PathKind::File,
        };
        assert!(!mismatch.is_retryable());

        let conflict = Error::ConflictingBinding {
            node: "node-1".to_string(),
            path: PathBuf::from("/data"),
            reason: "readOnly differs".to_string(),
        };
        assert!(!conflict.is_retryable());
        assert!(!Error::PermissionDenied {
            path: PathBuf::from("/root")
        }
        .is_retryable());
    }

    #[test]
    fn test_type_mismatch_message_names_both_kinds() {
        let err = Error::TypeMismatch {
            path: PathBuf::from("/data/b"),
            expected: PathKind::Directory,
            actual: PathKind::File,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected Directory"));
        assert!(msg.contains("found File"));
        assert_eq!(err.reason(), "TypeMismatch");
    }
}
