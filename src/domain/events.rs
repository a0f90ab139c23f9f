//! Domain Events
//!
//! Immutable records of what the engine did to bindings and backends.
//! They feed audit logs and let tests observe side effects without
//! reaching into the registry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::volume::{PathKey, PathKind};

/// Domain event representing a significant occurrence in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Binding Events
    // =========================================================================
    /// A workload was bound to a host path.
    VolumeBound {
        workload_id: String,
        node: String,
        host_path: PathBuf,
        ref_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A workload released a host path.
    VolumeReleased {
        workload_id: String,
        node: String,
        host_path: PathBuf,
        ref_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// The engine created a missing host path.
    PathCreated {
        node: String,
        host_path: PathBuf,
        kind: PathKind,
        mode: u32,
        timestamp: DateTime<Utc>,
    },

    /// A second workload declared the same path differently.
    BindingConflict {
        workload_id: String,
        node: String,
        host_path: PathBuf,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Backend Events
    // =========================================================================
    /// A plugin backend completed its handshake.
    BackendRegistered {
        backend_id: String,
        socket_path: PathBuf,
        capabilities: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A plugin backend left the active set.
    BackendDeregistered {
        backend_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Bindings lost their backend.
    MountsDegraded {
        backend_id: String,
        mounts: usize,
        timestamp: DateTime<Utc>,
    },

    /// Degraded bindings got their backend back.
    MountsRestored {
        backend_id: String,
        mounts: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn volume_bound(workload_id: &str, key: &PathKey, ref_count: usize) -> Self {
        DomainEvent::VolumeBound {
            workload_id: workload_id.to_string(),
            node: key.node.to_string(),
            host_path: key.host_path.clone(),
            ref_count,
            timestamp: Utc::now(),
        }
    }

    pub fn volume_released(workload_id: &str, key: &PathKey, ref_count: usize) -> Self {
        DomainEvent::VolumeReleased {
            workload_id: workload_id.to_string(),
            node: key.node.to_string(),
            host_path: key.host_path.clone(),
            ref_count,
            timestamp: Utc::now(),
        }
    }

    pub fn path_created(key: &PathKey, kind: PathKind, mode: u32) -> Self {
        DomainEvent::PathCreated {
            node: key.node.to_string(),
            host_path: key.host_path.clone(),
            kind,
            mode,
            timestamp: Utc::now(),
        }
    }

    pub fn binding_conflict(workload_id: &str, key: &PathKey, reason: &str) -> Self {
        DomainEvent::BindingConflict {
            workload_id: workload_id.to_string(),
            node: key.node.to_string(),
            host_path: key.host_path.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn backend_registered(
        backend_id: &str,
        socket_path: impl Into<PathBuf>,
        capabilities: Vec<String>,
    ) -> Self {
        DomainEvent::BackendRegistered {
            backend_id: backend_id.to_string(),
            socket_path: socket_path.into(),
            capabilities,
            timestamp: Utc::now(),
        }
    }

    pub fn backend_deregistered(backend_id: &str, reason: &str) -> Self {
        DomainEvent::BackendDeregistered {
            backend_id: backend_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::VolumeBound { .. } => "VolumeBound",
            DomainEvent::VolumeReleased { .. } => "VolumeReleased",
            DomainEvent::PathCreated { .. } => "PathCreated",
            DomainEvent::BindingConflict { .. } => "BindingConflict",
            DomainEvent::BackendRegistered { .. } => "BackendRegistered",
            DomainEvent::BackendDeregistered { .. } => "BackendDeregistered",
            DomainEvent::MountsDegraded { .. } => "MountsDegraded",
            DomainEvent::MountsRestored { .. } => "MountsRestored",
        }
    }

    /// Get the backend ID if applicable.
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            DomainEvent::BackendRegistered { backend_id, .. }
            | DomainEvent::BackendDeregistered { backend_id, .. }
            | DomainEvent::MountsDegraded { backend_id, .. }
            | DomainEvent::MountsRestored { backend_id, .. } => Some(backend_id),
            _ => None,
        }
    }

    /// Workload the event concerns, for binding events.
    pub fn workload_id(&self) -> Option<&str> {
        match self {
            DomainEvent::VolumeBound { workload_id, .. }
            | DomainEvent::VolumeReleased { workload_id, .. }
            | DomainEvent::BindingConflict { workload_id, .. } => Some(workload_id),
            _ => None,
        }
    }

    /// `(node, host path)` the event concerns, for path events.
    pub fn path(&self) -> Option<(&str, &Path)> {
        match self {
            DomainEvent::VolumeBound { node, host_path, .. }
            | DomainEvent::VolumeReleased { node, host_path, .. }
            | DomainEvent::PathCreated { node, host_path, .. }
            | DomainEvent::BindingConflict { node, host_path, .. } => {
                Some((node.as_str(), host_path.as_path()))
            }
            _ => None,
        }
    }

    /// Whether an operator should look at this event.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            DomainEvent::BindingConflict { .. }
                | DomainEvent::BackendDeregistered { .. }
                | DomainEvent::MountsDegraded { .. }
        )
    }
}
