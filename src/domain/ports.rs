//! Domain Ports (Port/Adapter Pattern)
//!
//! The engine's decision logic depends only on these traits. Adapters in
//! [`crate::adapters`] provide the host filesystem, the plugin socket
//! transport and event sinks, and tests swap in in-memory doubles.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  HostFilesystem │ BackendTransport │ EventPublisher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  StdHostFilesystem │ UnixSocketTransport │ Logging  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::domain::events::DomainEvent;
use crate::error::Result;
use crate::plugin::protocol::BackendInfo;
use crate::volume::{Ownership, PathKind};

// =============================================================================
// Host Filesystem Port
// =============================================================================

/// Blocking view of the host filesystem.
///
/// Every method is a blocking call and is only invoked from the engine's
/// bounded worker pool.
pub trait HostFilesystem: Send + Sync {
    /// Kind of `path` with symbolic links followed.
    ///
    /// Returns `Ok(None)` when the path does not exist, including a dangling
    /// symbolic link. Permission problems surface as
    /// [`io::ErrorKind::PermissionDenied`].
    fn stat(&self, path: &Path) -> io::Result<Option<PathKind>>;

    /// Create a directory (and missing parents) with `mode`.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the final component
    /// already exists, whatever its kind.
    fn create_directory(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create an empty regular file (and missing parent directories).
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the path already exists.
    fn create_file(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Change owner of a path the engine has just created.
    fn set_owner(&self, path: &Path, owner: Ownership) -> io::Result<()>;
}

// =============================================================================
// Plugin Transport Port
// =============================================================================

/// Client side of the plugin socket protocol.
///
/// Timeouts are applied by the caller, so implementations may block until
/// the backend answers.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Ask the backend listening on `socket` for its identity and capabilities.
    async fn get_info(&self, socket: &Path) -> Result<BackendInfo>;

    /// Liveness probe. `Ok(false)` means the backend answered but is not ready.
    async fn probe(&self, socket: &Path) -> Result<bool>;
}

// =============================================================================
// Event Publishing Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}
