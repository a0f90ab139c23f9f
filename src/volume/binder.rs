//! Mount Binder
//!
//! Builds the bind-mount descriptor handed to the workload lifecycle
//! manager. Pure construction; the mount syscall happens elsewhere.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::{require_absolute, PropagationMode};
use crate::error::Result;

/// Bind mount to perform when the workload starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Host path
    pub source: PathBuf,
    /// Path inside the workload
    pub target: PathBuf,
    pub propagation: PropagationMode,
    pub read_only: bool,
    /// OCI-style mount options (`rbind`, `ro`/`rw`, propagation flag)
    pub options: Vec<String>,
}

impl MountDescriptor {
    /// Propagation flag understood by OCI runtimes.
    pub fn propagation_option(mode: PropagationMode) -> &'static str {
        match mode {
            PropagationMode::None => "rprivate",
            PropagationMode::HostToContainer => "rslave",
            PropagationMode::Bidirectional => "rshared",
        }
    }
}

/// Stateless descriptor factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountBinder;

impl MountBinder {
    pub fn new() -> Self {
        Self
    }

    /// Describe a bind of `host_path` onto `target`.
    ///
    /// The read-only flag is carried through unchanged.
    pub fn bind(
        &self,
        host_path: &Path,
        target: &Path,
        propagation: PropagationMode,
        read_only: bool,
    ) -> Result<MountDescriptor> {
        require_absolute(host_path)?;
        require_absolute(target)?;

        let options = vec![
            "rbind".to_string(),
            if read_only { "ro" } else { "rw" }.to_string(),
            MountDescriptor::propagation_option(propagation).to_string(),
        ];

        Ok(MountDescriptor {
            source: host_path.to_path_buf(),
            target: target.to_path_buf(),
            propagation,
            read_only,
            options,
        })
    }
}
