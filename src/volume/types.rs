//! Volume Declaration Types
//!
//! Value objects shared by the validator, reconciler, binder and registry.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Workload identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(pub String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkloadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Node name as assigned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capability advertised by a plugin backend (e.g. `"local-lvm"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry key: one host path on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathKey {
    pub node: NodeName,
    pub host_path: PathBuf,
}

impl PathKey {
    pub fn new(node: NodeName, host_path: impl Into<PathBuf>) -> Self {
        Self {
            node,
            host_path: host_path.into(),
        }
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.host_path.display())
    }
}

// =============================================================================
// Path Kinds and Types
// =============================================================================

/// Filesystem category of an existing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKind {
    Directory,
    File,
    Socket,
    CharDevice,
    BlockDevice,
    /// FIFOs and anything else the engine never binds by declared type
    Other,
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKind::Directory => write!(f, "Directory"),
            PathKind::File => write!(f, "File"),
            PathKind::Socket => write!(f, "Socket"),
            PathKind::CharDevice => write!(f, "CharDevice"),
            PathKind::BlockDevice => write!(f, "BlockDevice"),
            PathKind::Other => write!(f, "Other"),
        }
    }
}

/// Declared type of a host path volume.
///
/// `Unset` is an explicit escape hatch: any existing path is accepted
/// without a kind check, and nothing is ever created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    DirectoryOrCreate,
    Directory,
    FileOrCreate,
    File,
    Socket,
    CharDevice,
    BlockDevice,
    Unset,
}

impl PathType {
    /// All declared types, in table order.
    pub const ALL: [PathType; 8] = [
        PathType::DirectoryOrCreate,
        PathType::Directory,
        PathType::FileOrCreate,
        PathType::File,
        PathType::Socket,
        PathType::CharDevice,
        PathType::BlockDevice,
        PathType::Unset,
    ];

    /// Kind the existing path must have; `None` means any kind.
    pub fn required_kind(&self) -> Option<PathKind> {
        match self {
            PathType::DirectoryOrCreate | PathType::Directory => Some(PathKind::Directory),
            PathType::FileOrCreate | PathType::File => Some(PathKind::File),
            PathType::Socket => Some(PathKind::Socket),
            PathType::CharDevice => Some(PathKind::CharDevice),
            PathType::BlockDevice => Some(PathKind::BlockDevice),
            PathType::Unset => None,
        }
    }

    /// Whether a missing path may be created.
    pub fn is_create_capable(&self) -> bool {
        matches!(self, PathType::DirectoryOrCreate | PathType::FileOrCreate)
    }

    /// Whether the path has to exist before the workload starts.
    pub fn must_pre_exist(&self) -> bool {
        !self.is_create_capable()
    }
}

impl std::fmt::Display for PathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathType::DirectoryOrCreate => write!(f, "DirectoryOrCreate"),
            PathType::Directory => write!(f, "Directory"),
            PathType::FileOrCreate => write!(f, "FileOrCreate"),
            PathType::File => write!(f, "File"),
            PathType::Socket => write!(f, "Socket"),
            PathType::CharDevice => write!(f, "CharDevice"),
            PathType::BlockDevice => write!(f, "BlockDevice"),
            PathType::Unset => write!(f, "Unset"),
        }
    }
}

// =============================================================================
// Propagation
// =============================================================================

/// Mount propagation between host and workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropagationMode {
    /// Private: nothing propagates in either direction
    #[default]
    None,
    /// Host mounts under the path become visible inside the workload
    HostToContainer,
    /// Mounts propagate both ways; plugin backends only
    Bidirectional,
}

impl std::fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropagationMode::None => write!(f, "None"),
            PropagationMode::HostToContainer => write!(f, "HostToContainer"),
            PropagationMode::Bidirectional => write!(f, "Bidirectional"),
        }
    }
}

/// What kind of workload is asking for the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkloadClass {
    /// Ordinary application workload
    #[default]
    Application,
    /// Storage backend agent that mounts sub-volumes for other workloads
    PluginBackend,
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadClass::Application => write!(f, "Application"),
            WorkloadClass::PluginBackend => write!(f, "PluginBackend"),
        }
    }
}

// =============================================================================
// Volume Spec
// =============================================================================

/// Ownership applied to paths the engine creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Volume declaration from a workload manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Absolute path on the host
    pub path: PathBuf,

    /// Declared type of the host path
    #[serde(rename = "type")]
    pub path_type: PathType,

    /// Mount read-only inside the workload
    #[serde(default)]
    pub read_only: bool,

    /// Absolute path inside the workload
    pub mount_target: PathBuf,

    #[serde(default)]
    pub propagation: PropagationMode,

    /// Owner for a newly created path; pre-existing paths are never chowned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership: Option<Ownership>,

    /// Plugin capability this volume depends on, if it is not purely local
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_capability: Option<Capability>,
}

impl VolumeSpec {
    /// Create a local host path volume spec.
    pub fn new(
        path: impl Into<PathBuf>,
        path_type: PathType,
        mount_target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            path_type,
            read_only: false,
            mount_target: mount_target.into(),
            propagation: PropagationMode::None,
            ownership: None,
            backend_capability: None,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_propagation(mut self, propagation: PropagationMode) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_ownership(mut self, uid: u32, gid: u32) -> Self {
        self.ownership = Some(Ownership { uid, gid });
        self
    }

    pub fn with_backend(mut self, capability: impl Into<Capability>) -> Self {
        self.backend_capability = Some(capability.into());
        self
    }

    /// Check the declaration is usable before any filesystem access.
    pub fn validate(&self) -> Result<()> {
        require_absolute(&self.path)?;
        require_absolute(&self.mount_target)?;
        Ok(())
    }

    /// Describe how this declaration differs from an existing binding's.
    ///
    /// Returns `None` when the declarations agree on type, access mode and
    /// propagation.
    pub fn divergence(
        &self,
        path_type: PathType,
        read_only: bool,
        propagation: PropagationMode,
    ) -> Option<String> {
        let mut diffs = Vec::new();
        if self.path_type != path_type {
            diffs.push(format!("type {} != bound {}", self.path_type, path_type));
        }
        if self.read_only != read_only {
            diffs.push(format!(
                "readOnly {} != bound {}",
                self.read_only, read_only
            ));
        }
        if self.propagation != propagation {
            diffs.push(format!(
                "propagation {} != bound {}",
                self.propagation, propagation
            ));
        }
        if diffs.is_empty() {
            None
        } else {
            Some(diffs.join(", "))
        }
    }
}

/// Reject relative paths and parent-directory traversal.
pub fn require_absolute(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is empty".to_string(),
        });
    }
    if !path.is_absolute() {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "path must be absolute".to_string(),
        });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidPath {
            path: path.to_path_buf(),
            reason: "path must not contain '..'".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_path_type_requirements() {
        assert_eq!(
            PathType::DirectoryOrCreate.required_kind(),
            Some(PathKind::Directory)
        );
        assert_eq!(PathType::FileOrCreate.required_kind(), Some(PathKind::File));
        assert_eq!(PathType::Unset.required_kind(), None);

        let creatable: Vec<_> = PathType::ALL
            .iter()
            .filter(|t| t.is_create_capable())
            .collect();
        assert_eq!(
            creatable,
            vec![&PathType::DirectoryOrCreate, &PathType::FileOrCreate]
        );
        assert!(PathType::Unset.must_pre_exist());
    }

    #[test]
    fn test_relative_paths_rejected() {
        let spec = VolumeSpec::new("data/a", PathType::Directory, "/data");
        assert_matches!(spec.validate(), Err(Error::InvalidPath { .. }));

        let spec = VolumeSpec::new("/data/a", PathType::Directory, "mnt");
        assert_matches!(spec.validate(), Err(Error::InvalidPath { .. }));

        let spec = VolumeSpec::new("/data/../etc", PathType::Directory, "/mnt");
        assert_matches!(spec.validate(), Err(Error::InvalidPath { .. }));

        let spec = VolumeSpec::new("/data/a", PathType::Directory, "/mnt");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_divergence_lists_every_difference() {
        let spec = VolumeSpec::new("/data", PathType::Directory, "/mnt").read_only(true);
        assert!(spec
            .divergence(PathType::Directory, true, PropagationMode::None)
            .is_none());

        let diff = spec
            .divergence(PathType::File, false, PropagationMode::None)
            .unwrap();
        assert!(diff.contains("type Directory != bound File"));
        assert!(diff.contains("readOnly true != bound false"));
        assert!(!diff.contains("propagation"));
    }

    #[test]
    fn test_volume_spec_deserializes_with_defaults() {
        let json = r#"{"path":"/var/log","type":"DirectoryOrCreate","mount_target":"/logs"}"#;
        let spec: VolumeSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.path_type, PathType::DirectoryOrCreate);
        assert!(!spec.read_only);
        assert_eq!(spec.propagation, PropagationMode::None);
        assert!(spec.ownership.is_none());
        assert!(spec.backend_capability.is_none());
    }

    #[test]
    fn test_path_type_must_be_explicit() {
        let json = r#"{"path":"/var/log","mount_target":"/logs"}"#;
        assert!(serde_json::from_str::<VolumeSpec>(json).is_err());
    }
}
