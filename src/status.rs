//! Node Status
//!
//! Read-only snapshot of everything the engine knows on this node, for
//! debugging tools. Built from lock-free registry reads, so it may be a few
//! operations behind under load but never blocks a bind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::{ReconcileLoop, WorkloadStatus};
use crate::plugin::{Candidate, PluginRegistrar};
use crate::volume::{BackendRegistration, BoundMount, NodeName, PoolStatus, WorkloadId};

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: NodeName,
    pub generated_at: DateTime<Utc>,
    pub mounts: Vec<BoundMount>,
    pub backends: Vec<BackendRegistration>,
    /// Sockets the registrar is tracking, registered or not
    pub candidates: Vec<Candidate>,
    pub workloads: BTreeMap<WorkloadId, WorkloadStatus>,
    pub pool: PoolStatus,
}

impl NodeStatus {
    pub fn collect(
        node: &NodeName,
        reconcile: &ReconcileLoop,
        registrar: Option<&PluginRegistrar>,
    ) -> Self {
        let registry = reconcile.registry();
        Self {
            node: node.clone(),
            generated_at: Utc::now(),
            mounts: registry
                .mounts()
                .into_iter()
                .filter(|m| &m.node == node)
                .collect(),
            backends: registry.backends(),
            candidates: registrar.map(|r| r.candidates()).unwrap_or_default(),
            workloads: reconcile.statuses(),
            pool: registry.pool_status(),
        }
    }

    pub fn degraded_mounts(&self) -> usize {
        self.mounts
            .iter()
            .filter(|m| m.state == crate::volume::MountState::Degraded)
            .count()
    }
}

/// Up while a long-running loop is inside its `run`.
#[derive(Debug, Default)]
pub struct RunFlag(AtomicBool);

impl RunFlag {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag until the guard drops, on return, panic or abort.
    pub(crate) fn enter(&self) -> RunGuard<'_> {
        self.0.store(true, Ordering::SeqCst);
        RunGuard(&self.0)
    }
}

pub(crate) struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Answer for `/readyz`: the agent is ready while its loops run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub reconcile_loop: bool,
    /// `None` when the agent runs without a registrar
    pub registrar: Option<bool>,
}

impl Readiness {
    pub fn check(reconcile: &ReconcileLoop, registrar: Option<&PluginRegistrar>) -> Self {
        Self {
            reconcile_loop: reconcile.is_running(),
            registrar: registrar.map(|r| r.is_running()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.reconcile_loop && self.registrar.unwrap_or(true)
    }
}
