//! Plugin Registrar
//!
//! Discovers backend sockets in the registration directory and decides
//! which of them to trust. Each socket moves through an explicit state
//! machine:
//!
//! ```text
//!  Discovered ──▶ Handshaking ──▶ Registered ──▶ Heartbeating
//!                      │               │              │
//!                      ▼               ▼              ▼
//!                 Deregistered ◀───────┴──────────────┘
//! ```
//!
//! - A failed or timed-out handshake, or `max_missed_heartbeats`
//!   consecutive failed probes, leave the candidate `Deregistered`. It stays
//!   visible in that phase until `handshake_retry_interval` has passed, then
//!   is rediscovered from scratch.
//! - A socket file disappearing deregisters the backend and forgets the
//!   candidate. Either way its bindings turn `Degraded`.
//!
//! The registrar talks to backends only through [`BackendTransport`] and to
//! the rest of the engine only through [`VolumeRegistry`]. Every step
//! (`observe`, `handshake_pending`, `heartbeat`) can be driven directly,
//! and `run` just calls them on timers.

use std::collections::{BTreeSet, HashMap};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::protocol::BackendInfo;
use crate::domain::ports::BackendTransport;
use crate::error::{Error, Result};
use crate::metrics;
use crate::status::RunFlag;
use crate::volume::{BackendRegistration, VolumeRegistry};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the plugin registrar
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Directory backends create their sockets in
    pub registration_dir: PathBuf,

    /// How often the directory is rescanned
    pub scan_interval: Duration,

    /// Bound on a single handshake, connect included
    pub handshake_timeout: Duration,

    /// Time between liveness probes
    pub heartbeat_interval: Duration,

    /// Bound on a single probe
    pub heartbeat_timeout: Duration,

    /// Consecutive failed probes before deregistration
    pub max_missed_heartbeats: u32,

    /// Quiet period before a rejected socket is tried again
    pub handshake_retry_interval: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            registration_dir: PathBuf::from("/var/lib/hostbind/plugins_registry"),
            scan_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            handshake_retry_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Lifecycle phase of one backend socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendPhase {
    Discovered,
    Handshaking,
    Registered,
    Heartbeating,
    Deregistered,
}

impl BackendPhase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: BackendPhase) -> bool {
        use BackendPhase::*;
        matches!(
            (self, next),
            (Discovered, Handshaking)
                | (Handshaking, Registered)
                | (Handshaking, Deregistered)
                | (Registered, Heartbeating)
                | (Registered, Deregistered)
                | (Heartbeating, Deregistered)
        )
    }

    /// Whether the backend is in the active set.
    pub fn is_active(self) -> bool {
        matches!(self, BackendPhase::Registered | BackendPhase::Heartbeating)
    }
}

impl std::fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A recorded phase change.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseChange {
    pub phase: BackendPhase,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A socket the registrar is tracking.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub socket_path: PathBuf,
    pub phase: BackendPhase,
    /// Set once the handshake succeeded
    pub backend_id: Option<String>,
    pub missed_heartbeats: u32,
    pub discovered_at: DateTime<Utc>,
    pub history: Vec<PhaseChange>,
    #[serde(skip)]
    deregistered_at: Option<Instant>,
}

impl Candidate {
    fn new(socket_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            socket_path,
            phase: BackendPhase::Discovered,
            backend_id: None,
            missed_heartbeats: 0,
            discovered_at: now,
            history: vec![PhaseChange {
                phase: BackendPhase::Discovered,
                timestamp: now,
                message: "socket discovered".to_string(),
            }],
            deregistered_at: None,
        }
    }

    /// Move to `Deregistered` and start the retry clock.
    fn deregister(&mut self, message: &str) {
        if let Err(e) = self.transition(BackendPhase::Deregistered, message) {
            debug!("{}", e);
            return;
        }
        self.deregistered_at = Some(Instant::now());
    }

    /// Whether a deregistered candidate may be handshaken again.
    fn retry_due(&self, interval: Duration) -> bool {
        self.phase == BackendPhase::Deregistered
            && self
                .deregistered_at
                .map(|at| at.elapsed() >= interval)
                .unwrap_or(true)
    }

    fn transition(&mut self, phase: BackendPhase, message: &str) -> Result<()> {
        if !self.phase.can_transition_to(phase) {
            return Err(Error::Internal(format!(
                "illegal backend transition {} -> {} for {}",
                self.phase,
                phase,
                self.socket_path.display()
            )));
        }
        debug!(socket = %self.socket_path.display(), from = %self.phase, to = %phase, "{}", message);
        self.phase = phase;
        self.history.push(PhaseChange {
            phase,
            timestamp: Utc::now(),
            message: message.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Registrar
// =============================================================================

/// Discovery server for plugin backends on this node.
pub struct PluginRegistrar {
    config: RegistrarConfig,
    transport: Arc<dyn BackendTransport>,
    registry: Arc<VolumeRegistry>,
    candidates: Mutex<HashMap<PathBuf, Candidate>>,
    running: RunFlag,
}

impl std::fmt::Debug for PluginRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistrar")
            .field("config", &self.config)
            .field("candidates", &self.candidates.lock().len())
            .finish()
    }
}

impl PluginRegistrar {
    pub fn new(
        config: RegistrarConfig,
        transport: Arc<dyn BackendTransport>,
        registry: Arc<VolumeRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            candidates: Mutex::new(HashMap::new()),
            running: RunFlag::default(),
        }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Whether `run` is scanning and probing.
    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    /// Snapshot of tracked sockets, ordered by path.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<_> = self.candidates.lock().values().cloned().collect();
        candidates.sort_by(|a, b| a.socket_path.cmp(&b.socket_path));
        candidates
    }

    pub fn phase(&self, socket: &Path) -> Option<BackendPhase> {
        self.candidates.lock().get(socket).map(|c| c.phase)
    }

    /// Why the socket was deregistered, while it waits to be retried.
    pub fn rejection(&self, socket: &Path) -> Option<String> {
        self.candidates
            .lock()
            .get(socket)
            .filter(|c| c.phase == BackendPhase::Deregistered)
            .and_then(|c| c.history.last())
            .map(|change| change.message.clone())
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// List socket files in the registration directory.
    ///
    /// A missing directory means no backends yet.
    pub async fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.config.registration_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.config.registration_dir.display(), "Registration directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut sockets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.file_type().is_socket() => sockets.push(path),
                Ok(_) => {}
                // Removed between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to stat registration entry: {}", e),
            }
        }
        sockets.sort();
        Ok(sockets)
    }

    /// Reconcile tracked candidates with the sockets currently present.
    ///
    /// New sockets, and deregistered ones past their retry interval, become
    /// `Discovered`; sockets that vanished are deregistered and forgotten.
    pub async fn observe(&self, present: &[PathBuf]) {
        let present: BTreeSet<&PathBuf> = present.iter().collect();

        let removed: Vec<Candidate> = {
            let mut candidates = self.candidates.lock();
            let gone: Vec<PathBuf> = candidates
                .keys()
                .filter(|p| !present.contains(p))
                .cloned()
                .collect();
            gone.iter().filter_map(|p| candidates.remove(p)).collect()
        };

        {
            let retry_interval = self.config.handshake_retry_interval;
            let mut candidates = self.candidates.lock();
            for socket in present {
                match candidates.get(socket) {
                    Some(c) if c.retry_due(retry_interval) => {
                        info!(socket = %socket.display(), "Retrying backend socket");
                    }
                    Some(_) => continue,
                    None => info!(socket = %socket.display(), "Discovered backend socket"),
                }
                candidates.insert(socket.clone(), Candidate::new(socket.clone()));
            }
        }

        for candidate in removed {
            match candidate.backend_id {
                Some(backend_id) if candidate.phase.is_active() => {
                    self.registry
                        .deregister_backend(&backend_id, "socket removed")
                        .await;
                }
                _ => {
                    debug!(socket = %candidate.socket_path.display(), "Candidate socket removed before registration")
                }
            }
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Handshake with every `Discovered` candidate concurrently.
    ///
    /// Returns the ids of backends registered by this call.
    pub async fn handshake_pending(&self) -> Vec<String> {
        let sockets: Vec<PathBuf> = {
            let mut candidates = self.candidates.lock();
            candidates
                .values_mut()
                .filter(|c| c.phase == BackendPhase::Discovered)
                .filter_map(|c| {
                    c.transition(BackendPhase::Handshaking, "requesting identity")
                        .ok()
                        .map(|_| c.socket_path.clone())
                })
                .collect()
        };
        if sockets.is_empty() {
            return Vec::new();
        }

        let results = join_all(sockets.iter().map(|socket| self.handshake(socket))).await;

        let mut registered = Vec::new();
        for (socket, result) in sockets.into_iter().zip(results) {
            match result.and_then(|info| self.admit(&socket, info)) {
                Ok(registration) => {
                    let backend_id = registration.backend_id.clone();
                    let still_tracked = {
                        let mut candidates = self.candidates.lock();
                        match candidates.get_mut(&socket) {
                            Some(candidate) => {
                                candidate.backend_id = Some(backend_id.clone());
                                candidate
                                    .transition(BackendPhase::Registered, "handshake complete")
                                    .is_ok()
                            }
                            None => false,
                        }
                    };
                    if still_tracked {
                        self.registry.register_backend(registration).await;
                        registered.push(backend_id);
                    }
                }
                Err(e) => self.reject(&socket, &e),
            }
        }
        registered
    }

    #[instrument(skip(self, socket), fields(socket = %socket.display()))]
    async fn handshake(&self, socket: &Path) -> Result<BackendInfo> {
        let timeout = self.config.handshake_timeout;
        let info = tokio::time::timeout(timeout, self.transport.get_info(socket))
            .await
            .map_err(|_| Error::HandshakeTimeout {
                socket: socket.to_path_buf(),
                timeout,
            })??;

        info.validate().map_err(|reason| Error::HandshakeFailed {
            socket: socket.to_path_buf(),
            reason,
        })?;
        Ok(info)
    }

    /// Trust decision after a well-formed handshake.
    fn admit(&self, socket: &Path, info: BackendInfo) -> Result<BackendRegistration> {
        if let Some(existing) = self.registry.backend(&info.backend_id) {
            let holder_live = existing.socket_path != socket
                && self
                    .candidates
                    .lock()
                    .get(&existing.socket_path)
                    .map(|c| c.phase.is_active())
                    .unwrap_or(false);
            if holder_live {
                return Err(Error::HandshakeFailed {
                    socket: socket.to_path_buf(),
                    reason: format!(
                        "backend id {} already registered from {}",
                        info.backend_id,
                        existing.socket_path.display()
                    ),
                });
            }
        }

        let mut registration =
            BackendRegistration::new(info.backend_id, socket, info.capabilities);
        registration.version = info.version;
        Ok(registration)
    }

    fn reject(&self, socket: &Path, err: &Error) {
        warn!(socket = %socket.display(), "Backend handshake failed: {}", err);
        metrics::HANDSHAKE_FAILURES
            .with_label_values(&[err.reason()])
            .inc();

        if let Some(candidate) = self.candidates.lock().get_mut(socket) {
            candidate.deregister(&err.to_string());
        }
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    /// Probe every active backend once.
    ///
    /// Returns the ids of backends deregistered by this call.
    pub async fn heartbeat(&self) -> Vec<String> {
        let active: Vec<(PathBuf, String)> = self
            .candidates
            .lock()
            .values()
            .filter(|c| c.phase.is_active())
            .filter_map(|c| c.backend_id.clone().map(|id| (c.socket_path.clone(), id)))
            .collect();
        if active.is_empty() {
            return Vec::new();
        }

        let timeout = self.config.heartbeat_timeout;
        let probes = active.iter().map(|(socket, _)| async move {
            match tokio::time::timeout(timeout, self.transport.probe(socket)).await {
                Ok(Ok(ready)) => ready,
                Ok(Err(e)) => {
                    debug!(socket = %socket.display(), "Probe failed: {}", e);
                    false
                }
                Err(_) => false,
            }
        });
        let results = join_all(probes).await;

        let mut deregistered = Vec::new();
        for ((socket, backend_id), alive) in active.into_iter().zip(results) {
            if alive {
                if let Some(candidate) = self.candidates.lock().get_mut(&socket) {
                    candidate.missed_heartbeats = 0;
                    if candidate.phase == BackendPhase::Registered {
                        let _ = candidate.transition(BackendPhase::Heartbeating, "first heartbeat");
                    }
                }
                self.registry.record_heartbeat(&backend_id);
                continue;
            }

            let missed = {
                let mut candidates = self.candidates.lock();
                match candidates.get_mut(&socket) {
                    Some(candidate) => {
                        candidate.missed_heartbeats += 1;
                        candidate.missed_heartbeats
                    }
                    None => continue,
                }
            };
            let err = Error::HeartbeatMissed {
                backend_id: backend_id.clone(),
                missed,
            };
            warn!(backend = %backend_id, missed, max = self.config.max_missed_heartbeats, "{}", err);

            if missed >= self.config.max_missed_heartbeats {
                self.retire(&socket, &backend_id, &err).await;
                deregistered.push(backend_id);
            }
        }
        deregistered
    }

    /// Deregister a backend whose socket is still present.
    async fn retire(&self, socket: &Path, backend_id: &str, err: &Error) {
        if let Some(candidate) = self.candidates.lock().get_mut(socket) {
            candidate.deregister(&err.to_string());
        }
        self.registry
            .deregister_backend(backend_id, "heartbeat missed")
            .await;
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    /// One discovery pass: scan, observe, handshake.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let sockets = self.scan().await?;
        self.observe(&sockets).await;
        Ok(self.handshake_pending().await)
    }

    /// Run discovery and heartbeats until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let _running = self.running.enter();
        info!(
            dir = %self.config.registration_dir.display(),
            "Starting plugin registrar"
        );

        let mut scan_tick = interval(self.config.scan_interval);
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_tick = interval(self.config.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Plugin registrar shutting down");
                    break;
                }

                _ = scan_tick.tick() => {
                    if let Err(e) = self.discover().await {
                        error!("Backend discovery failed: {}", e);
                    }
                }

                _ = heartbeat_tick.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryFilesystem};
    use crate::volume::{
        Capability, MountState, NodeName, PathKey, PathKind, PathType, VolumeSpec,
        WorkerPoolConfig, WorkloadClass,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    // =========================================================================
    // Fake transport
    // =========================================================================

    #[derive(Clone)]
    enum Behavior {
        Answer(BackendInfo),
        Hang,
        Garbage,
    }

    #[derive(Default)]
    struct FakeTransport {
        behaviors: Mutex<HashMap<PathBuf, Behavior>>,
        down: Mutex<HashMap<PathBuf, Arc<AtomicBool>>>,
    }

    impl FakeTransport {
        fn answer(&self, socket: &str, id: &str, capabilities: &[&str]) {
            self.behaviors.lock().insert(
                PathBuf::from(socket),
                Behavior::Answer(BackendInfo {
                    backend_id: id.to_string(),
                    version: "1.0".to_string(),
                    capabilities: capabilities.iter().map(|c| Capability::new(*c)).collect(),
                }),
            );
        }

        fn set(&self, socket: &str, behavior: Behavior) {
            self.behaviors.lock().insert(PathBuf::from(socket), behavior);
        }

        fn set_down(&self, socket: &str, down: bool) {
            self.down
                .lock()
                .entry(PathBuf::from(socket))
                .or_default()
                .store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BackendTransport for FakeTransport {
        async fn get_info(&self, socket: &Path) -> Result<BackendInfo> {
            let behavior = self.behaviors.lock().get(socket).cloned();
            match behavior {
                Some(Behavior::Answer(info)) => Ok(info),
                Some(Behavior::Hang) => std::future::pending().await,
                Some(Behavior::Garbage) | None => Err(Error::HandshakeFailed {
                    socket: socket.to_path_buf(),
                    reason: "malformed response".to_string(),
                }),
            }
        }

        async fn probe(&self, socket: &Path) -> Result<bool> {
            let down = self
                .down
                .lock()
                .get(socket)
                .map(|d| d.load(Ordering::SeqCst))
                .unwrap_or(false);
            Ok(!down)
        }
    }

    fn setup() -> (Arc<FakeTransport>, Arc<VolumeRegistry>, PluginRegistrar) {
        setup_with(Arc::new(InMemoryFilesystem::new()))
    }

    fn setup_with(
        fs: Arc<InMemoryFilesystem>,
    ) -> (Arc<FakeTransport>, Arc<VolumeRegistry>, PluginRegistrar) {
        let transport = Arc::new(FakeTransport::default());
        let registry = Arc::new(
            VolumeRegistry::new(fs, WorkerPoolConfig::default())
                .with_event_publisher(Arc::new(InMemoryEventCollector::new())),
        );
        let registrar =
            PluginRegistrar::new(RegistrarConfig::default(), transport.clone(), registry.clone());
        (transport, registry, registrar)
    }

    fn sockets(paths: &[&str]) -> Vec<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    #[test]
    fn test_phase_transitions() {
        use BackendPhase::*;
        assert!(Discovered.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Heartbeating));
        assert!(Heartbeating.can_transition_to(Deregistered));
        assert!(!Discovered.can_transition_to(Registered));
        assert!(!Deregistered.can_transition_to(Registered));
        assert!(!Heartbeating.can_transition_to(Handshaking));
    }

    #[tokio::test]
    async fn test_handshake_registers_backend() {
        let (transport, registry, registrar) = setup();
        transport.answer("/registry/lvm.sock", "lvm", &["local-lvm"]);

        registrar.observe(&sockets(&["/registry/lvm.sock"])).await;
        assert_eq!(
            registrar.phase(Path::new("/registry/lvm.sock")),
            Some(BackendPhase::Discovered)
        );

        assert_eq!(registrar.handshake_pending().await, vec!["lvm".to_string()]);
        assert_eq!(
            registrar.phase(Path::new("/registry/lvm.sock")),
            Some(BackendPhase::Registered)
        );
        let backend = registry.backend("lvm").unwrap();
        assert!(backend.offers(&Capability::new("local-lvm")));
        assert_eq!(backend.version, "1.0");

        registrar.heartbeat().await;
        assert_eq!(
            registrar.phase(Path::new("/registry/lvm.sock")),
            Some(BackendPhase::Heartbeating)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_deregisters_candidate() {
        let (transport, registry, registrar) = setup();
        transport.set("/registry/driver.sock", Behavior::Hang);

        registrar.observe(&sockets(&["/registry/driver.sock"])).await;
        assert!(registrar.handshake_pending().await.is_empty());

        assert!(registry.backends().is_empty());
        assert_eq!(
            registrar.phase(Path::new("/registry/driver.sock")),
            Some(BackendPhase::Deregistered)
        );
        let phases: Vec<_> = registrar.candidates()[0]
            .history
            .iter()
            .map(|c| c.phase)
            .collect();
        assert_eq!(
            phases,
            vec![
                BackendPhase::Discovered,
                BackendPhase::Handshaking,
                BackendPhase::Deregistered
            ]
        );
        assert!(registrar
            .rejection(Path::new("/registry/driver.sock"))
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_socket_waits_for_retry_interval() {
        let (transport, registry, registrar) = setup();
        transport.set("/registry/bad.sock", Behavior::Garbage);
        let present = sockets(&["/registry/bad.sock"]);

        registrar.observe(&present).await;
        registrar.handshake_pending().await;

        // Fixed, but still in the quiet period
        transport.answer("/registry/bad.sock", "bad", &["x"]);
        registrar.observe(&present).await;
        assert!(registrar.handshake_pending().await.is_empty());
        assert_eq!(
            registrar.phase(Path::new("/registry/bad.sock")),
            Some(BackendPhase::Deregistered)
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        registrar.observe(&present).await;
        assert_eq!(
            registrar.phase(Path::new("/registry/bad.sock")),
            Some(BackendPhase::Discovered)
        );
        registrar.handshake_pending().await;
        assert!(registry.backend("bad").is_some());
    }

    #[tokio::test]
    async fn test_malformed_identity_rejected() {
        let (transport, registry, registrar) = setup();
        transport.answer("/registry/anon.sock", "  ", &["x"]);

        registrar.observe(&sockets(&["/registry/anon.sock"])).await;
        registrar.handshake_pending().await;
        assert!(registry.backends().is_empty());
        assert!(registrar.rejection(Path::new("/registry/anon.sock")).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_backend_id_rejected() {
        let (transport, registry, registrar) = setup();
        transport.answer("/registry/a.sock", "lvm", &["local-lvm"]);
        transport.answer("/registry/b.sock", "lvm", &["local-lvm"]);

        registrar.observe(&sockets(&["/registry/a.sock"])).await;
        registrar.handshake_pending().await;
        registrar
            .observe(&sockets(&["/registry/a.sock", "/registry/b.sock"]))
            .await;
        registrar.handshake_pending().await;

        assert_eq!(
            registry.backend("lvm").unwrap().socket_path,
            PathBuf::from("/registry/a.sock")
        );
        assert!(registrar
            .rejection(Path::new("/registry/b.sock"))
            .unwrap()
            .contains("already registered"));
    }

    #[tokio::test]
    async fn test_missed_heartbeats_degrade_mounts() {
        let fs = Arc::new(InMemoryFilesystem::new());
        fs.insert("/var/lib/lvm/vol-1", PathKind::Directory);
        let (transport, registry, registrar) = setup_with(fs);
        transport.answer("/registry/lvm.sock", "lvm", &["local-lvm"]);
        registrar.observe(&sockets(&["/registry/lvm.sock"])).await;
        registrar.handshake_pending().await;

        let node = NodeName::new("node-1");
        registry
            .acquire(
                &"db-0".into(),
                &node,
                WorkloadClass::Application,
                &VolumeSpec::new("/var/lib/lvm/vol-1", PathType::Directory, "/data")
                    .with_backend("local-lvm"),
            )
            .await
            .unwrap();

        transport.set_down("/registry/lvm.sock", true);
        assert!(registrar.heartbeat().await.is_empty());
        assert!(registrar.heartbeat().await.is_empty());
        assert_eq!(registrar.heartbeat().await, vec!["lvm".to_string()]);

        assert!(registry.backend("lvm").is_none());
        let mount = registry
            .mount(&PathKey::new(node, "/var/lib/lvm/vol-1"))
            .unwrap();
        assert_eq!(mount.state, MountState::Degraded);
        assert_eq!(mount.ref_count, 1);
        assert_eq!(
            registrar.phase(Path::new("/registry/lvm.sock")),
            Some(BackendPhase::Deregistered)
        );
        assert!(registrar
            .rejection(Path::new("/registry/lvm.sock"))
            .unwrap()
            .contains("heartbeat"));

        // Still quiet: no new handshake even though the socket is present.
        transport.set_down("/registry/lvm.sock", false);
        registrar.observe(&sockets(&["/registry/lvm.sock"])).await;
        assert!(registrar.handshake_pending().await.is_empty());
        assert!(registry.backend("lvm").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_missed_count() {
        let (transport, registry, registrar) = setup();
        transport.answer("/registry/lvm.sock", "lvm", &["local-lvm"]);
        registrar.observe(&sockets(&["/registry/lvm.sock"])).await;
        registrar.handshake_pending().await;

        transport.set_down("/registry/lvm.sock", true);
        registrar.heartbeat().await;
        registrar.heartbeat().await;
        transport.set_down("/registry/lvm.sock", false);
        registrar.heartbeat().await;
        transport.set_down("/registry/lvm.sock", true);
        registrar.heartbeat().await;

        assert!(registry.backend("lvm").is_some());
        assert_eq!(registrar.candidates()[0].missed_heartbeats, 1);
    }

    #[tokio::test]
    async fn test_socket_removal_deregisters() {
        let (transport, registry, registrar) = setup();
        transport.answer("/registry/lvm.sock", "lvm", &["local-lvm"]);
        registrar.observe(&sockets(&["/registry/lvm.sock"])).await;
        registrar.handshake_pending().await;

        registrar.observe(&[]).await;
        assert!(registry.backends().is_empty());
        assert!(registrar.candidates().is_empty());
    }

    #[tokio::test]
    async fn test_run_reports_running_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, registry, _) = setup();
        let registrar = Arc::new(PluginRegistrar::new(
            RegistrarConfig {
                registration_dir: dir.path().join("absent"),
                ..Default::default()
            },
            transport,
            registry,
        ));
        assert!(!registrar.is_running());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(registrar.clone().run(shutdown.clone()));
        for _ in 0..100 {
            if registrar.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registrar.is_running());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(!registrar.is_running());
    }

    #[tokio::test]
    async fn test_scan_lists_only_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let _listener = tokio::net::UnixListener::bind(dir.path().join("lvm.sock")).unwrap();
        std::fs::write(dir.path().join("README"), b"not a socket").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let (transport, registry, _) = setup();
        let registrar = PluginRegistrar::new(
            RegistrarConfig {
                registration_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            transport.clone(),
            registry.clone(),
        );

        assert_eq!(registrar.scan().await.unwrap(), vec![dir.path().join("lvm.sock")]);

        let missing = PluginRegistrar::new(
            RegistrarConfig {
                registration_dir: dir.path().join("absent"),
                ..Default::default()
            },
            transport,
            registry,
        );
        assert!(missing.scan().await.unwrap().is_empty());
    }
}
