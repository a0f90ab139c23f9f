//! Plugin Socket Protocol
//!
//! Backends listen on a Unix domain stream socket in the registration
//! directory. The registrar is always the client.
//!
//! # Wire Format
//!
//! Newline-delimited JSON, one request and one response per exchange:
//!
//! ```text
//! → {"type":"get_info"}
//! ← {"backend_id":"lvm","version":"1.2.0","capabilities":["local-lvm"]}
//!
//! → {"type":"probe"}
//! ← {"ready":true}
//! ```
//!
//! A frame longer than [`MAX_FRAME_BYTES`] is a protocol violation.

use serde::{Deserialize, Serialize};

use crate::volume::Capability;

/// Upper bound on a single response frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Requests sent by the registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrarRequest {
    /// Identity and capability list
    GetInfo,
    /// Liveness check
    Probe,
}

/// Response to [`RegistrarRequest::GetInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl BackendInfo {
    /// Reject responses the registrar cannot trust.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.backend_id.trim().is_empty() {
            return Err("empty backend_id".to_string());
        }
        if self.backend_id.chars().any(char::is_control) {
            return Err("backend_id contains control characters".to_string());
        }
        if self.capabilities.iter().any(|c| c.as_str().trim().is_empty()) {
            return Err("empty capability name".to_string());
        }
        Ok(())
    }
}

/// Response to [`RegistrarRequest::Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}
