//! Volume Registry
//!
//! Process-wide record of which workloads hold which host paths on which
//! node, plus the set of registered plugin backends. It is the only shared
//! mutable state between the reconciliation loop and the plugin registrar.
//!
//! # Locking
//!
//! - Acquire and release of one `(node, hostPath)` pair serialize on a
//!   per-path async mutex: validate → reconcile → bind → record never
//!   interleaves with another acquirer of the same path.
//! - Different paths proceed in parallel.
//! - Read-only queries (`mounts`, `backends`) iterate the concurrent maps
//!   without taking path locks.
//!
//! Releasing a binding only deletes bookkeeping. Host data is never touched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::binder::{MountBinder, MountDescriptor};
use super::pool::{BlockingPool, PoolStatus, WorkerPoolConfig};
use super::reconciler::{PathReconciler, ReconcileOutcome};
use super::types::{
    Capability, NodeName, PathKey, PathKind, PathType, PropagationMode, VolumeSpec, WorkloadClass,
    WorkloadId,
};
use super::validator::{PathTypeValidator, ValidationVerdict};
use crate::adapters::LoggingEventPublisher;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, HostFilesystem};
use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Records
// =============================================================================

/// Whether new operations may use a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountState {
    Active,
    /// The backend it depends on is gone; the mount itself may still be live
    Degraded,
}

/// Registry record for one bound host path.
#[derive(Debug, Clone, Serialize)]
pub struct BoundMount {
    /// Workload that created the record
    pub workload_id: WorkloadId,
    pub node: NodeName,
    pub host_path: PathBuf,
    /// Target of the first holder
    pub mount_target: PathBuf,
    pub path_type: PathType,
    pub propagation: PropagationMode,
    pub read_only: bool,
    /// Kind observed when the binding was made
    pub resolved_kind: PathKind,
    /// Number of workloads holding the binding; always `holders.len()`
    pub ref_count: usize,
    /// Holding workloads and their mount targets
    pub holders: BTreeMap<WorkloadId, PathBuf>,
    pub backend_id: Option<String>,
    pub state: MountState,
    pub created_at: DateTime<Utc>,
}

impl BoundMount {
    pub fn key(&self) -> PathKey {
        PathKey::new(self.node.clone(), self.host_path.clone())
    }
}

/// A plugin backend that completed its handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRegistration {
    pub backend_id: String,
    pub socket_path: PathBuf,
    pub version: String,
    pub capabilities: BTreeSet<Capability>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl BackendRegistration {
    pub fn new(
        backend_id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let now = Utc::now();
        Self {
            backend_id: backend_id.into(),
            socket_path: socket_path.into(),
            version: String::new(),
            capabilities: capabilities.into_iter().collect(),
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn offers(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Result of a successful acquire.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub mount: BoundMount,
    pub descriptor: MountDescriptor,
    /// This acquire created the host path
    pub created_path: bool,
}

/// Fresh verdict for one bound path of a workload.
#[derive(Debug, Clone, Serialize)]
pub struct PathCheck {
    pub host_path: PathBuf,
    pub path_type: PathType,
    pub verdict: ValidationVerdict,
}

impl PathCheck {
    /// Whether the path no longer satisfies its binding.
    pub fn drifted(&self) -> bool {
        !self.verdict.is_ok() || self.verdict.create_action.is_some()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Injectable registry service; one per node agent, one per test.
pub struct VolumeRegistry {
    validator: PathTypeValidator,
    reconciler: PathReconciler,
    binder: MountBinder,
    pool: BlockingPool,
    events: Arc<dyn EventPublisher>,
    mounts: DashMap<PathKey, BoundMount>,
    workloads: DashMap<WorkloadId, BTreeSet<PathKey>>,
    path_locks: DashMap<PathKey, Arc<Mutex<()>>>,
    backends: DashMap<String, BackendRegistration>,
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeRegistry")
            .field("mounts", &self.mounts.len())
            .field("workloads", &self.workloads.len())
            .field("backends", &self.backends.len())
            .finish()
    }
}

impl VolumeRegistry {
    /// Create a registry over `fs`, logging domain events.
    pub fn new(fs: Arc<dyn HostFilesystem>, pool_config: WorkerPoolConfig) -> Self {
        Self {
            validator: PathTypeValidator::new(fs.clone()),
            reconciler: PathReconciler::new(fs),
            binder: MountBinder::new(),
            pool: BlockingPool::new(pool_config),
            events: Arc::new(LoggingEventPublisher),
            mounts: DashMap::new(),
            workloads: DashMap::new(),
            path_locks: DashMap::new(),
            backends: DashMap::new(),
        }
    }

    /// Replace the event publisher.
    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    // =========================================================================
    // Acquire / Release
    // =========================================================================

    /// Bind `spec` for `workload_id` on `node`.
    ///
    /// Re-validates the host path on every call. The record is written only
    /// after every fallible step succeeded, so dropping this future leaves no
    /// partial binding behind.
    #[instrument(skip(self, spec), fields(workload = %workload_id, node = %node, path = %spec.path.display()))]
    pub async fn acquire(
        &self,
        workload_id: &WorkloadId,
        node: &NodeName,
        class: WorkloadClass,
        spec: &VolumeSpec,
    ) -> Result<Acquired> {
        let result = self.try_acquire(workload_id, node, class, spec).await;

        let label = match &result {
            Ok(_) => "bound",
            Err(e) => e.reason(),
        };
        metrics::ACQUIRE_TOTAL.with_label_values(&[label]).inc();
        result
    }

    async fn try_acquire(
        &self,
        workload_id: &WorkloadId,
        node: &NodeName,
        class: WorkloadClass,
        spec: &VolumeSpec,
    ) -> Result<Acquired> {
        spec.validate()?;

        if spec.propagation == PropagationMode::Bidirectional
            && class != WorkloadClass::PluginBackend
        {
            return Err(Error::PropagationNotPermitted {
                workload_id: workload_id.to_string(),
                mode: spec.propagation.to_string(),
            });
        }

        let key = PathKey::new(node.clone(), spec.path.clone());
        let lock = self.path_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.acquire_locked(workload_id, &key, spec).await
        };
        drop(lock);
        self.prune_lock(&key);

        let acquired = result?;
        if acquired.created_path {
            let kind = acquired.mount.resolved_kind;
            self.publish(DomainEvent::path_created(&key, kind, default_mode(kind)))
                .await;
        }
        self.publish(DomainEvent::volume_bound(
            workload_id.as_str(),
            &key,
            acquired.mount.ref_count,
        ))
        .await;
        Ok(acquired)
    }

    /// Everything between taking and releasing the path lock.
    async fn acquire_locked(
        &self,
        workload_id: &WorkloadId,
        key: &PathKey,
        spec: &VolumeSpec,
    ) -> Result<Acquired> {
        let existing = self.mounts.get(key).map(|m| m.clone());

        let backend_id = match &existing {
            Some(mount) => {
                if let Some(reason) =
                    spec.divergence(mount.path_type, mount.read_only, mount.propagation)
                {
                    warn!(existing = %mount.workload_id, "Conflicting binding: {}", reason);
                    self.publish(DomainEvent::binding_conflict(
                        workload_id.as_str(),
                        key,
                        &reason,
                    ))
                    .await;
                    return Err(Error::ConflictingBinding {
                        node: key.node.to_string(),
                        path: key.host_path.clone(),
                        reason,
                    });
                }
                if mount.state == MountState::Degraded {
                    return Err(Error::BackendDegraded {
                        backend_id: mount.backend_id.clone().unwrap_or_default(),
                        path: key.host_path.clone(),
                    });
                }
                mount.backend_id.clone()
            }
            None => match &spec.backend_capability {
                Some(capability) => Some(self.backend_for(capability).ok_or_else(|| {
                    Error::BackendUnavailable {
                        capability: capability.to_string(),
                    }
                })?),
                None => None,
            },
        };

        let verdict = self.validate(&spec.path, spec.path_type).await?;
        let verdict = verdict.into_result(&spec.path, spec.path_type)?;

        let mut created_path = false;
        let resolved_kind = match verdict.create_action {
            Some(action) => {
                let action = action.with_owner(spec.ownership);
                let reconciler = self.reconciler.clone();
                let path = spec.path.clone();
                let outcome = self
                    .pool
                    .run("reconcile", &spec.path, move || {
                        reconciler.reconcile(&path, &action)
                    })
                    .await?;
                if outcome == ReconcileOutcome::Created {
                    created_path = true;
                    metrics::PATHS_CREATED
                        .with_label_values(&[&action.kind.to_string()])
                        .inc();
                }
                action.kind
            }
            None => verdict.resolved_kind.ok_or_else(|| {
                Error::Internal("valid verdict without a resolved kind".to_string())
            })?,
        };

        if let Some(mount) = &existing {
            if mount.resolved_kind != resolved_kind {
                return Err(Error::ConflictingBinding {
                    node: key.node.to_string(),
                    path: key.host_path.clone(),
                    reason: format!(
                        "bound as {} but now resolves to {}",
                        mount.resolved_kind, resolved_kind
                    ),
                });
            }
        }

        let descriptor = self.binder.bind(
            &spec.path,
            &spec.mount_target,
            spec.propagation,
            spec.read_only,
        )?;

        // No await from here on: record and index change together. Backend
        // liveness is re-read while the entry is held, since a deregistration
        // may have landed while validation was in the pool.
        let mount = match self.mounts.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let mount = entry.get_mut();
                if mount.state == MountState::Degraded {
                    return Err(Error::BackendDegraded {
                        backend_id: mount.backend_id.clone().unwrap_or_default(),
                        path: key.host_path.clone(),
                    });
                }
                if mount.holders.contains_key(workload_id) {
                    debug!("Workload already holds this binding");
                }
                mount
                    .holders
                    .insert(workload_id.clone(), spec.mount_target.clone());
                mount.ref_count = mount.holders.len();
                mount.clone()
            }
            Entry::Vacant(entry) => {
                if let (Some(id), Some(capability)) = (&backend_id, &spec.backend_capability) {
                    if !self.backends.contains_key(id) {
                        warn!(backend = %id, "Backend deregistered during acquire");
                        return Err(Error::BackendUnavailable {
                            capability: capability.to_string(),
                        });
                    }
                }
                let mut holders = BTreeMap::new();
                holders.insert(workload_id.clone(), spec.mount_target.clone());
                let mount = BoundMount {
                    workload_id: workload_id.clone(),
                    node: key.node.clone(),
                    host_path: key.host_path.clone(),
                    mount_target: spec.mount_target.clone(),
                    path_type: spec.path_type,
                    propagation: spec.propagation,
                    read_only: spec.read_only,
                    resolved_kind,
                    ref_count: 1,
                    holders,
                    backend_id,
                    state: MountState::Active,
                    created_at: Utc::now(),
                };
                metrics::BOUND_MOUNTS.inc();
                entry.insert(mount).clone()
            }
        };
        self.workloads
            .entry(workload_id.clone())
            .or_default()
            .insert(key.clone());

        info!(ref_count = mount.ref_count, "Bound host path");
        Ok(Acquired {
            mount,
            descriptor,
            created_path,
        })
    }

    /// Drop every binding held by `workload_id`.
    ///
    /// Idempotent: a second call for the same workload is a no-op. Returns
    /// the number of bindings released.
    #[instrument(skip(self), fields(workload = %workload_id))]
    pub async fn release(&self, workload_id: &WorkloadId) -> usize {
        let keys = match self.workloads.remove(workload_id) {
            Some((_, keys)) => keys,
            None => {
                debug!("Release for unknown workload ignored");
                return 0;
            }
        };

        let mut released = 0;
        for key in keys {
            let lock = self.path_lock(&key);
            let remaining = {
                let _guard = lock.lock().await;
                match self.mounts.entry(key.clone()) {
                    Entry::Occupied(mut entry) => {
                        let mount = entry.get_mut();
                        if mount.holders.remove(workload_id).is_none() {
                            None
                        } else {
                            mount.ref_count = mount.holders.len();
                            let remaining = mount.ref_count;
                            if remaining == 0 {
                                entry.remove();
                                metrics::BOUND_MOUNTS.dec();
                            }
                            Some(remaining)
                        }
                    }
                    Entry::Vacant(_) => None,
                }
            };
            drop(lock);
            self.prune_lock(&key);

            if let Some(remaining) = remaining {
                released += 1;
                info!(path = %key.host_path.display(), ref_count = remaining, "Released host path binding");
                self.publish(DomainEvent::volume_released(
                    workload_id.as_str(),
                    &key,
                    remaining,
                ))
                .await;
            }
        }

        if released > 0 {
            metrics::RELEASE_TOTAL.inc();
        }
        released
    }

    /// Re-validate every path `workload_id` holds, without changing records.
    pub async fn verify(&self, workload_id: &WorkloadId) -> Result<Vec<PathCheck>> {
        let keys = self
            .workloads
            .get(workload_id)
            .map(|k| k.clone())
            .ok_or_else(|| Error::WorkloadNotFound(workload_id.to_string()))?;

        let mut checks = Vec::with_capacity(keys.len());
        for key in keys {
            let path_type = match self.mounts.get(&key) {
                Some(mount) => mount.path_type,
                None => continue,
            };
            let verdict = self.validate(&key.host_path, path_type).await?;
            checks.push(PathCheck {
                host_path: key.host_path,
                path_type,
                verdict,
            });
        }
        Ok(checks)
    }

    async fn validate(&self, path: &Path, path_type: PathType) -> Result<ValidationVerdict> {
        let validator = self.validator.clone();
        let owned = path.to_path_buf();
        self.pool
            .run("validate", path, move || validator.validate(&owned, path_type))
            .await
    }

    // =========================================================================
    // Backends
    // =========================================================================

    /// Add a backend to the active set and revive bindings that depend on it.
    pub async fn register_backend(&self, registration: BackendRegistration) {
        let backend_id = registration.backend_id.clone();
        let capabilities = registration
            .capabilities
            .iter()
            .map(|c| c.to_string())
            .collect();
        let socket = registration.socket_path.clone();
        self.backends.insert(backend_id.clone(), registration);
        metrics::BACKENDS_ACTIVE.set(self.backends.len() as i64);

        let restored = self.set_backend_state(&backend_id, MountState::Active);
        info!(backend = %backend_id, restored, "Backend registered");

        self.publish(DomainEvent::backend_registered(
            &backend_id,
            socket,
            capabilities,
        ))
        .await;
        if restored > 0 {
            self.publish(DomainEvent::MountsRestored {
                backend_id,
                mounts: restored,
                timestamp: Utc::now(),
            })
            .await;
        }
    }

    /// Remove a backend and mark its bindings degraded. Returns the number
    /// of degraded bindings.
    pub async fn deregister_backend(&self, backend_id: &str, reason: &str) -> usize {
        if self.backends.remove(backend_id).is_none() {
            return 0;
        }
        metrics::BACKENDS_ACTIVE.set(self.backends.len() as i64);

        let degraded = self.set_backend_state(backend_id, MountState::Degraded);
        warn!(backend = %backend_id, degraded, reason, "Backend deregistered");

        self.publish(DomainEvent::backend_deregistered(backend_id, reason))
            .await;
        if degraded > 0 {
            self.publish(DomainEvent::MountsDegraded {
                backend_id: backend_id.to_string(),
                mounts: degraded,
                timestamp: Utc::now(),
            })
            .await;
        }
        degraded
    }

    pub fn record_heartbeat(&self, backend_id: &str) {
        if let Some(mut backend) = self.backends.get_mut(backend_id) {
            backend.last_heartbeat = Utc::now();
        }
    }

    fn set_backend_state(&self, backend_id: &str, state: MountState) -> usize {
        let mut changed = 0;
        for mut mount in self.mounts.iter_mut() {
            if mount.backend_id.as_deref() == Some(backend_id) && mount.state != state {
                mount.state = state;
                changed += 1;
            }
        }
        changed
    }

    /// Registered backend offering `capability`; lowest id wins.
    fn backend_for(&self, capability: &Capability) -> Option<String> {
        self.backends
            .iter()
            .filter(|b| b.offers(capability))
            .map(|b| b.backend_id.clone())
            .min()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn backend(&self, backend_id: &str) -> Option<BackendRegistration> {
        self.backends.get(backend_id).map(|b| b.clone())
    }

    pub fn backends(&self) -> Vec<BackendRegistration> {
        let mut backends: Vec<_> = self.backends.iter().map(|b| b.clone()).collect();
        backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        backends
    }

    pub fn mount(&self, key: &PathKey) -> Option<BoundMount> {
        self.mounts.get(key).map(|m| m.clone())
    }

    /// Snapshot of all bindings, ordered by node and path.
    pub fn mounts(&self) -> Vec<BoundMount> {
        let mut mounts: Vec<_> = self.mounts.iter().map(|m| m.clone()).collect();
        mounts.sort_by(|a, b| (&a.node, &a.host_path).cmp(&(&b.node, &b.host_path)));
        mounts
    }

    /// Whether `workload_id` holds any binding.
    pub fn holds(&self, workload_id: &WorkloadId) -> bool {
        self.workloads.contains_key(workload_id)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn path_lock(&self, key: &PathKey) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock once nobody else holds or waits on it.
    fn prune_lock(&self, key: &PathKey) {
        self.path_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish domain event: {}", e);
        }
    }
}

fn default_mode(kind: PathKind) -> u32 {
    match kind {
        PathKind::Directory => super::validator::DEFAULT_DIRECTORY_MODE,
        _ => super::validator::DEFAULT_FILE_MODE,
    }
}
