//! Plugin Backends
//!
//! Discovery, handshake and liveness tracking for storage backends that
//! register over local sockets.

pub mod protocol;
pub mod registrar;

pub use protocol::{BackendInfo, ProbeResponse, RegistrarRequest, MAX_FRAME_BYTES};
pub use registrar::{BackendPhase, Candidate, PhaseChange, PluginRegistrar, RegistrarConfig};
