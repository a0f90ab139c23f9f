//! Reconciliation Loop
//!
//! Single coordinating loop per node. It drains a queue of create, verify
//! and teardown requests and drives each workload's volumes through the
//! registry.
//!
//! ```text
//!   submit() ──▶ [ mpsc queue ] ──▶ run()
//!                                    │
//!            ┌───────────────────────┼──────────────────────┐
//!            ▼                       ▼                      ▼
//!         Create                  Verify                Teardown
//!   spawn workload task     re-validate bound      cancel task, await it,
//!   (acquire + backoff)     paths, mark Drifted    release held bindings
//! ```
//!
//! Retry policy lives only here. Retryable errors put the workload in
//! `WaitingForVolume` and back off (1s doubling to 30s, no attempt limit);
//! everything else fails the workload and releases whatever it had already
//! acquired.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use crate::error::{Error, Result};
use crate::metrics;
use crate::status::RunFlag;
use crate::volume::{
    MountDescriptor, NodeName, VolumeRegistry, VolumeSpec, WorkloadClass, WorkloadId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciliation loop
#[derive(Debug, Clone)]
pub struct ReconcileLoopConfig {
    /// Retry schedule for retryable bind failures
    pub backoff: Backoff,

    /// Requests buffered before `submit` waits
    pub queue_capacity: usize,
}

impl Default for ReconcileLoopConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            queue_capacity: 1024,
        }
    }
}

// =============================================================================
// Requests and Status
// =============================================================================

/// Scheduler decision: bind these volumes for a workload on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub workload_id: WorkloadId,
    pub node: NodeName,
    #[serde(default)]
    pub class: WorkloadClass,
    pub volumes: Vec<VolumeSpec>,
}

impl BindingRequest {
    pub fn new(
        workload_id: impl Into<WorkloadId>,
        node: impl Into<NodeName>,
        volumes: Vec<VolumeSpec>,
    ) -> Self {
        Self {
            workload_id: workload_id.into(),
            node: node.into(),
            class: WorkloadClass::Application,
            volumes,
        }
    }

    pub fn with_class(mut self, class: WorkloadClass) -> Self {
        self.class = class;
        self
    }

    /// Reject requests that can never bind.
    pub fn validate(&self) -> Result<()> {
        if self.workload_id.as_str().trim().is_empty() {
            return Err(Error::Config("workload_id must not be empty".to_string()));
        }
        if self.node.as_str().trim().is_empty() {
            return Err(Error::Config("node must not be empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for spec in &self.volumes {
            spec.validate()?;
            if !seen.insert(&spec.path) {
                return Err(Error::InvalidPath {
                    path: spec.path.clone(),
                    reason: "declared more than once for the same workload".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Work item for the loop.
#[derive(Debug, Clone)]
pub enum VolumeRequest {
    Create(BindingRequest),
    Verify(WorkloadId),
    Teardown(WorkloadId),
}

impl VolumeRequest {
    pub fn workload_id(&self) -> &WorkloadId {
        match self {
            VolumeRequest::Create(request) => &request.workload_id,
            VolumeRequest::Verify(id) | VolumeRequest::Teardown(id) => id,
        }
    }
}

/// What a workload's volumes look like right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum WorkloadStatus {
    /// Queued, no attempt made yet
    Pending,

    /// A retryable error is being retried; resolves once host state is fixed
    WaitingForVolume {
        path: PathBuf,
        reason: String,
        message: String,
        attempts: u32,
        next_retry_ms: u64,
    },

    /// Every volume is bound
    Bound { mounts: Vec<MountDescriptor> },

    /// Terminal; needs a manifest or operator change
    Failed { reason: String, message: String },

    /// Bound, but a verify found the host paths changed underneath
    Drifted {
        message: String,
        mounts: Vec<MountDescriptor>,
    },
}

impl WorkloadStatus {
    pub fn is_bound(&self) -> bool {
        matches!(self, WorkloadStatus::Bound { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadStatus::Failed { .. })
    }

    pub fn mounts(&self) -> &[MountDescriptor] {
        match self {
            WorkloadStatus::Bound { mounts } | WorkloadStatus::Drifted { mounts, .. } => mounts,
            _ => &[],
        }
    }
}

struct WorkloadTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Loop
// =============================================================================

/// Per-node reconciliation loop.
pub struct ReconcileLoop {
    config: ReconcileLoopConfig,
    registry: Arc<VolumeRegistry>,
    sender: mpsc::Sender<VolumeRequest>,
    receiver: Mutex<Option<mpsc::Receiver<VolumeRequest>>>,
    statuses: Arc<DashMap<WorkloadId, WorkloadStatus>>,
    tasks: Mutex<HashMap<WorkloadId, WorkloadTask>>,
    running: RunFlag,
}

impl std::fmt::Debug for ReconcileLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileLoop")
            .field("config", &self.config)
            .field("workloads", &self.statuses.len())
            .finish()
    }
}

impl ReconcileLoop {
    pub fn new(config: ReconcileLoopConfig, registry: Arc<VolumeRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            registry,
            sender,
            receiver: Mutex::new(Some(receiver)),
            statuses: Arc::new(DashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            running: RunFlag::default(),
        }
    }

    /// Whether `run` is draining the queue.
    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    /// Enqueue a request.
    ///
    /// Create requests are checked up front so a malformed manifest is
    /// rejected to the caller instead of becoming a failed workload.
    pub async fn submit(&self, request: VolumeRequest) -> Result<()> {
        if let VolumeRequest::Create(binding) = &request {
            binding.validate()?;
            self.statuses
                .entry(binding.workload_id.clone())
                .or_insert(WorkloadStatus::Pending);
        }
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::QueueClosed)
    }

    pub fn status(&self, workload_id: &WorkloadId) -> Option<WorkloadStatus> {
        self.statuses.get(workload_id).map(|s| s.clone())
    }

    pub fn statuses(&self) -> BTreeMap<WorkloadId, WorkloadStatus> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drain the queue until `shutdown` is cancelled.
    ///
    /// Only one `run` may consume the queue; a second call returns
    /// immediately with an error.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("reconcile loop already running".to_string()))?;
        let _running = self.running.enter();

        info!(backoff = ?self.config.backoff, "Starting reconciliation loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciliation loop shutting down");
                    break;
                }

                request = receiver.recv() => {
                    match request {
                        Some(request) => self.handle(request, &shutdown).await,
                        None => break,
                    }
                }
            }
        }

        let tasks: Vec<WorkloadTask> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        Ok(())
    }

    async fn handle(&self, request: VolumeRequest, shutdown: &CancellationToken) {
        debug!(workload = %request.workload_id(), "Processing volume request");
        match request {
            VolumeRequest::Create(binding) => self.start(binding, shutdown),
            VolumeRequest::Verify(workload_id) => self.verify(workload_id),
            VolumeRequest::Teardown(workload_id) => self.teardown(&workload_id).await,
        }
    }

    fn start(&self, binding: BindingRequest, shutdown: &CancellationToken) {
        let workload_id = binding.workload_id.clone();
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&workload_id) {
            if !task.handle.is_finished() {
                debug!(workload = %workload_id, "Bind already in progress");
                return;
            }
        }

        self.statuses
            .insert(workload_id.clone(), WorkloadStatus::Pending);
        let cancel = shutdown.child_token();
        let handle = tokio::spawn(bind_workload(
            self.registry.clone(),
            self.statuses.clone(),
            self.config.backoff,
            binding,
            cancel.clone(),
        ));
        tasks.insert(workload_id, WorkloadTask { cancel, handle });
    }

    /// Re-validate a bound workload's paths in the background.
    fn verify(&self, workload_id: WorkloadId) {
        let mounts = match self.status(&workload_id) {
            Some(status @ (WorkloadStatus::Bound { .. } | WorkloadStatus::Drifted { .. })) => {
                status.mounts().to_vec()
            }
            _ => {
                debug!(workload = %workload_id, "Verify ignored for workload that is not bound");
                return;
            }
        };

        let registry = self.registry.clone();
        let statuses = self.statuses.clone();
        tokio::spawn(async move {
            let checks = match registry.verify(&workload_id).await {
                Ok(checks) => checks,
                Err(e) => {
                    warn!(workload = %workload_id, "Verify failed: {}", e);
                    return;
                }
            };

            let drifted: Vec<String> = checks
                .iter()
                .filter(|c| c.drifted())
                .map(|c| format!("{} no longer satisfies {}", c.host_path.display(), c.path_type))
                .collect();

            let status = if drifted.is_empty() {
                WorkloadStatus::Bound { mounts }
            } else {
                warn!(workload = %workload_id, "Host paths drifted: {}", drifted.join("; "));
                WorkloadStatus::Drifted {
                    message: drifted.join("; "),
                    mounts,
                }
            };
            // A teardown that raced the verify wins
            if let Some(mut entry) = statuses.get_mut(&workload_id) {
                *entry = status;
            }
        });
    }

    /// Cancel any in-flight bind, then drop the workload's bindings.
    #[instrument(skip(self), fields(workload = %workload_id))]
    async fn teardown(&self, workload_id: &WorkloadId) {
        let task = self.tasks.lock().remove(workload_id);
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!("Bind task ended abnormally: {}", e);
            }
        }

        if self.registry.holds(workload_id) {
            self.registry.release(workload_id).await;
        }
        if self.statuses.remove(workload_id).is_some() {
            info!("Workload torn down");
        }
    }
}

/// Acquire every volume of one workload, retrying until bound, failed or
/// cancelled.
async fn bind_workload(
    registry: Arc<VolumeRegistry>,
    statuses: Arc<DashMap<WorkloadId, WorkloadStatus>>,
    backoff: Backoff,
    binding: BindingRequest,
    cancel: CancellationToken,
) {
    let workload_id = &binding.workload_id;
    let mut mounts = Vec::with_capacity(binding.volumes.len());

    for spec in &binding.volumes {
        let mut attempts: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(workload = %workload_id, "Bind cancelled");
                    return;
                }
                result = registry.acquire(workload_id, &binding.node, binding.class, spec) => result,
            };

            match result {
                Ok(acquired) => {
                    mounts.push(acquired.descriptor);
                    break;
                }
                Err(e) if e.is_retryable() => {
                    attempts = attempts.saturating_add(1);
                    let delay = backoff.delay(attempts);
                    metrics::BIND_RETRIES.inc();
                    info!(
                        workload = %workload_id,
                        path = %spec.path.display(),
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Waiting for volume: {}",
                        e
                    );
                    statuses.insert(
                        workload_id.clone(),
                        WorkloadStatus::WaitingForVolume {
                            path: spec.path.clone(),
                            reason: e.reason().to_string(),
                            message: e.to_string(),
                            attempts,
                            next_retry_ms: delay.as_millis() as u64,
                        },
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(workload = %workload_id, "Bind cancelled while backing off");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        workload = %workload_id,
                        path = %spec.path.display(),
                        "Volume bind failed: {}",
                        e
                    );
                    // Keep nothing half-bound
                    registry.release(workload_id).await;
                    statuses.insert(
                        workload_id.clone(),
                        WorkloadStatus::Failed {
                            reason: e.reason().to_string(),
                            message: e.to_string(),
                        },
                    );
                    return;
                }
            }
        }
    }

    info!(workload = %workload_id, volumes = mounts.len(), "Workload volumes bound");
    statuses.insert(workload_id.clone(), WorkloadStatus::Bound { mounts });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryFilesystem};
    use crate::volume::{PathKey, PathKind, PathType, WorkerPoolConfig};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Harness {
        fs: Arc<InMemoryFilesystem>,
        looper: Arc<ReconcileLoop>,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let fs = Arc::new(InMemoryFilesystem::new());
            let registry = Arc::new(
                VolumeRegistry::new(fs.clone(), WorkerPoolConfig::default())
                    .with_event_publisher(Arc::new(InMemoryEventCollector::new())),
            );
            let looper = Arc::new(ReconcileLoop::new(
                ReconcileLoopConfig {
                    backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
                    ..Default::default()
                },
                registry,
            ));
            let shutdown = CancellationToken::new();
            tokio::spawn(looper.clone().run(shutdown.clone()));
            Self {
                fs,
                looper,
                shutdown,
            }
        }

        async fn wait_for<F>(&self, id: &str, done: F) -> WorkloadStatus
        where
            F: Fn(&WorkloadStatus) -> bool,
        {
            let id = WorkloadId::new(id);
            for _ in 0..500 {
                if let Some(status) = self.looper.status(&id) {
                    if done(&status) {
                        return status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("workload {} never reached the expected status", id);
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    #[tokio::test]
    async fn test_create_binds_all_volumes() {
        let h = Harness::new();
        h.fs.insert("/var/log", PathKind::Directory);
        h.looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "web-0",
                "node-1",
                vec![
                    VolumeSpec::new("/var/log", PathType::Directory, "/host-logs").read_only(true),
                    VolumeSpec::new("/data/cache", PathType::DirectoryOrCreate, "/cache"),
                ],
            )))
            .await
            .unwrap();

        let status = h.wait_for("web-0", |s| s.is_bound()).await;
        assert_eq!(status.mounts().len(), 2);
        assert!(status.mounts()[0].read_only);
        assert_eq!(h.fs.entry("/data/cache").unwrap().kind, PathKind::Directory);
    }

    #[tokio::test]
    async fn test_missing_path_waits_then_binds() {
        let h = Harness::new();
        h.looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![VolumeSpec::new("/data/a", PathType::Directory, "/a")],
            )))
            .await
            .unwrap();

        let status = h
            .wait_for("app", |s| matches!(s, WorkloadStatus::WaitingForVolume { attempts, .. } if *attempts >= 2))
            .await;
        assert_matches!(status, WorkloadStatus::WaitingForVolume { reason, .. } if reason == "MissingAndNotCreatable");
        assert_eq!(h.fs.creation_count(), 0);

        h.fs.insert("/data/a", PathKind::Directory);
        h.wait_for("app", |s| s.is_bound()).await;
    }

    #[tokio::test]
    async fn test_type_mismatch_is_terminal_and_releases_partial() {
        let h = Harness::new();
        h.fs.insert("/data/ok", PathKind::Directory);
        h.fs.insert("/data/b", PathKind::File);
        h.looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![
                    VolumeSpec::new("/data/ok", PathType::Directory, "/ok"),
                    VolumeSpec::new("/data/b", PathType::Directory, "/b"),
                ],
            )))
            .await
            .unwrap();

        let status = h.wait_for("app", |s| s.is_terminal()).await;
        assert_matches!(status, WorkloadStatus::Failed { reason, .. } if reason == "TypeMismatch");
        assert!(!h.looper.registry().holds(&"app".into()));
        assert!(h.looper.registry().mounts().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_cancels_waiting_bind() {
        let h = Harness::new();
        h.looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![VolumeSpec::new("/data/never", PathType::File, "/f")],
            )))
            .await
            .unwrap();
        h.wait_for("app", |s| matches!(s, WorkloadStatus::WaitingForVolume { .. }))
            .await;

        h.looper
            .submit(VolumeRequest::Teardown("app".into()))
            .await
            .unwrap();
        for _ in 0..200 {
            if h.looper.status(&"app".into()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.looper.status(&"app".into()).is_none());

        // The path appearing later must not resurrect the binding
        h.fs.insert("/data/never", PathKind::File);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.looper.registry().mounts().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_teardown_is_noop() {
        let h = Harness::new();
        h.fs.insert("/data", PathKind::Directory);
        for id in ["a", "b"] {
            h.looper
                .submit(VolumeRequest::Create(BindingRequest::new(
                    id,
                    "node-1",
                    vec![VolumeSpec::new("/data", PathType::Directory, "/data")],
                )))
                .await
                .unwrap();
            h.wait_for(id, |s| s.is_bound()).await;
        }

        for _ in 0..2 {
            h.looper
                .submit(VolumeRequest::Teardown("a".into()))
                .await
                .unwrap();
        }
        h.looper
            .submit(VolumeRequest::Verify("b".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = PathKey::new(NodeName::new("node-1"), "/data");
        assert_eq!(h.looper.registry().mount(&key).unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_verify_marks_drift() {
        let h = Harness::new();
        h.fs.insert("/data/a", PathKind::Directory);
        h.looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![VolumeSpec::new("/data/a", PathType::Directory, "/a")],
            )))
            .await
            .unwrap();
        h.wait_for("app", |s| s.is_bound()).await;

        h.fs.remove("/data/a");
        h.looper
            .submit(VolumeRequest::Verify("app".into()))
            .await
            .unwrap();
        let status = h
            .wait_for("app", |s| matches!(s, WorkloadStatus::Drifted { .. }))
            .await;
        assert_eq!(status.mounts().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_at_submit() {
        let h = Harness::new();
        let err = h
            .looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![
                    VolumeSpec::new("/data", PathType::Directory, "/a"),
                    VolumeSpec::new("/data", PathType::Directory, "/b"),
                ],
            )))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidPath { .. });

        let err = h
            .looper
            .submit(VolumeRequest::Create(BindingRequest::new(
                "app",
                "node-1",
                vec![VolumeSpec::new("data", PathType::Directory, "/a")],
            )))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidPath { .. });
        assert!(h.looper.status(&"app".into()).is_none());
    }

    #[test]
    fn test_binding_request_json() {
        let request: BindingRequest = serde_json::from_str(
            r#"{"workload_id":"web-0","node":"node-1","volumes":[
                {"path":"/var/log","type":"Directory","read_only":true,"mount_target":"/logs"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(request.class, WorkloadClass::Application);
        assert!(request.volumes[0].read_only);
        assert!(request.validate().is_ok());
    }
}
