//! Path Type Validator
//!
//! Decides whether a host path matches its declared [`PathType`] and, if
//! policy allows, what should be created. It never mutates the filesystem:
//! each call performs exactly one status query through the
//! [`HostFilesystem`] port.
//!
//! # Decision table
//!
//! ```text
//! declared            │ missing                  │ wrong kind    │ right kind
//! ────────────────────┼──────────────────────────┼───────────────┼───────────
//! DirectoryOrCreate   │ OK + create dir (0755)   │ TypeMismatch  │ OK
//! FileOrCreate        │ OK + create file (0644)  │ TypeMismatch  │ OK
//! Directory/File/...  │ MissingAndNotCreatable   │ TypeMismatch  │ OK
//! Unset               │ MissingAndNotCreatable   │ OK (any kind) │ OK
//! ```
//!
//! A mismatch is terminal. Create-if-missing never means
//! overwrite-if-wrong-kind.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{require_absolute, Ownership, PathKind, PathType};
use crate::domain::ports::HostFilesystem;
use crate::error::{Error, Result};

/// Mode for directories the engine creates.
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Mode for regular files the engine creates.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

// =============================================================================
// Verdict
// =============================================================================

/// What should be created for a missing, create-capable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAction {
    /// Directory or File
    pub kind: PathKind,
    /// Permission bits
    pub mode: u32,
    /// Owner override; `None` keeps the engine's own identity
    pub owner: Option<Ownership>,
}

impl CreateAction {
    fn for_kind(kind: PathKind) -> Self {
        let mode = match kind {
            PathKind::Directory => DEFAULT_DIRECTORY_MODE,
            _ => DEFAULT_FILE_MODE,
        };
        Self {
            kind,
            mode,
            owner: None,
        }
    }

    /// Apply the owner declared by the volume spec, if any.
    pub fn with_owner(mut self, owner: Option<Ownership>) -> Self {
        self.owner = owner;
        self
    }
}

/// Outcome of a single validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Ok,
    TypeMismatch { expected: PathKind, actual: PathKind },
    MissingAndNotCreatable,
    PermissionDenied,
}

/// Result of validating one path. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub outcome: ValidationOutcome,
    /// Kind found on disk after following symbolic links
    pub resolved_kind: Option<PathKind>,
    pub create_action: Option<CreateAction>,
}

impl ValidationVerdict {
    fn ok(resolved_kind: Option<PathKind>, create_action: Option<CreateAction>) -> Self {
        Self {
            outcome: ValidationOutcome::Ok,
            resolved_kind,
            create_action,
        }
    }

    fn rejected(outcome: ValidationOutcome, resolved_kind: Option<PathKind>) -> Self {
        Self {
            outcome,
            resolved_kind,
            create_action: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == ValidationOutcome::Ok
    }

    /// Turn a rejecting verdict into the matching error.
    pub fn into_result(self, path: &Path, path_type: PathType) -> Result<Self> {
        match self.outcome {
            ValidationOutcome::Ok => Ok(self),
            ValidationOutcome::TypeMismatch { expected, actual } => Err(Error::TypeMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            }),
            ValidationOutcome::MissingAndNotCreatable => Err(Error::MissingAndNotCreatable {
                path: path.to_path_buf(),
                path_type,
            }),
            ValidationOutcome::PermissionDenied => Err(Error::PermissionDenied {
                path: path.to_path_buf(),
            }),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Stateless validator over an injected filesystem view.
#[derive(Clone)]
pub struct PathTypeValidator {
    fs: Arc<dyn HostFilesystem>,
}

impl std::fmt::Debug for PathTypeValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathTypeValidator").finish_non_exhaustive()
    }
}

impl PathTypeValidator {
    pub fn new(fs: Arc<dyn HostFilesystem>) -> Self {
        Self { fs }
    }

    /// Validate `path` against `declared`.
    ///
    /// Relative paths are rejected before touching the filesystem. I/O
    /// errors other than "not found" and "permission denied" are returned
    /// as [`Error::Io`].
    pub fn validate(&self, path: &Path, declared: PathType) -> Result<ValidationVerdict> {
        require_absolute(path)?;

        if declared == PathType::Unset {
            warn!(
                path = %path.display(),
                "Volume declared with Unset type; kind checks are disabled for this path"
            );
        }

        let actual = match self.fs.stat(path) {
            Ok(kind) => kind,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(path = %path.display(), "Permission denied while inspecting path");
                return Ok(ValidationVerdict::rejected(
                    ValidationOutcome::PermissionDenied,
                    None,
                ));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let verdict = match (actual, declared.required_kind()) {
            (None, Some(kind)) if declared.is_create_capable() => {
                ValidationVerdict::ok(None, Some(CreateAction::for_kind(kind)))
            }
            (None, _) => {
                ValidationVerdict::rejected(ValidationOutcome::MissingAndNotCreatable, None)
            }
            (Some(actual), None) => ValidationVerdict::ok(Some(actual), None),
            (Some(actual), Some(expected)) if actual == expected => {
                ValidationVerdict::ok(Some(actual), None)
            }
            (Some(actual), Some(expected)) => ValidationVerdict::rejected(
                ValidationOutcome::TypeMismatch { expected, actual },
                Some(actual),
            ),
        };

        debug!(
            path = %path.display(),
            declared = %declared,
            outcome = ?verdict.outcome,
            "Validated host path"
        );
        Ok(verdict)
    }
}
