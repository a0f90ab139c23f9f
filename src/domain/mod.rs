//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the host filesystem,
//!   plugin transport and event sinks
//! - **Events** (`events.rs`) - Domain events for audit and decoupling

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{BackendTransport, EventPublisher, HostFilesystem};
