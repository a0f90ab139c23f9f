//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   HostFilesystem │ BackendTransport │ EventPublisher        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ StdHostFilesystem │ InMemoryFilesystem                     │ │
//! │  │ UnixSocketTransport │ LoggingEventPublisher                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hostbind::adapters::StdHostFilesystem;
//! use hostbind::volume::{PathTypeValidator, PathType};
//!
//! let validator = PathTypeValidator::new(Arc::new(StdHostFilesystem::new()));
//! let verdict = validator.validate(Path::new("/var/log"), PathType::Directory)?;
//! ```

mod host_fs;
mod memory_fs;
mod unix_socket;

pub use host_fs::{kind_of, StdHostFilesystem};
pub use memory_fs::{InMemoryFilesystem, MemoryEntry};
pub use unix_socket::UnixSocketTransport;

mod event_publisher;
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
