//! Path Reconciler
//!
//! Owns the filesystem mutations behind a `CreateAction`. Creation is
//! idempotent: losing a race to a concurrent creator of the right kind is
//! success. Pre-existing paths are never deleted, re-created, chmod-ed or
//! chown-ed.
//!
//! Nothing here retries. Every failure other than a kind mismatch is
//! reported as a retryable [`Error::Reconcile`] and the reconciliation loop
//! decides when to try again.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use super::types::PathKind;
use super::validator::CreateAction;
use crate::domain::ports::HostFilesystem;
use crate::error::{Error, Result};

/// What a successful reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileOutcome {
    /// This call created the path
    Created,
    /// A concurrent caller created it first, with the right kind
    AlreadyPresent,
}

/// Applies create actions to the host filesystem.
#[derive(Clone)]
pub struct PathReconciler {
    fs: Arc<dyn HostFilesystem>,
}

impl std::fmt::Debug for PathReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathReconciler").finish_non_exhaustive()
    }
}

impl PathReconciler {
    pub fn new(fs: Arc<dyn HostFilesystem>) -> Self {
        Self { fs }
    }

    /// Create `path` as described by `action`.
    pub fn reconcile(&self, path: &Path, action: &CreateAction) -> Result<ReconcileOutcome> {
        let created = match action.kind {
            PathKind::Directory => self.fs.create_directory(path, action.mode),
            PathKind::File => self.fs.create_file(path, action.mode),
            other => {
                return Err(Error::Internal(format!(
                    "create action for unsupported kind {}",
                    other
                )))
            }
        };

        match created {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    kind = %action.kind,
                    mode = format!("{:o}", action.mode),
                    "Created host path"
                );
                if let Some(owner) = action.owner {
                    // The path is ours now, so a failed chown cannot be undone
                    // by deleting it; surface it and let the operator fix it.
                    self.fs.set_owner(path, owner).map_err(|e| {
                        error!(path = %path.display(), uid = owner.uid, gid = owner.gid, "Failed to set owner: {}", e);
                        reconcile_error(path, "set owner", &e)
                    })?;
                }
                Ok(ReconcileOutcome::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => self.recheck(path, action),
            Err(e) => Err(reconcile_error(path, "create", &e)),
        }
    }

    /// Someone else got there first: re-validate instead of failing.
    fn recheck(&self, path: &Path, action: &CreateAction) -> Result<ReconcileOutcome> {
        match self.fs.stat(path) {
            Ok(Some(actual)) if actual == action.kind => {
                debug!(path = %path.display(), "Path created concurrently with the expected kind");
                Ok(ReconcileOutcome::AlreadyPresent)
            }
            Ok(Some(actual)) => Err(Error::TypeMismatch {
                path: path.to_path_buf(),
                expected: action.kind,
                actual,
            }),
            Ok(None) => Err(Error::Reconcile {
                path: path.to_path_buf(),
                reason: "path exists but does not resolve (dangling symbolic link)".to_string(),
            }),
            Err(e) => Err(reconcile_error(path, "re-validate", &e)),
        }
    }
}

fn reconcile_error(path: &Path, step: &str, e: &io::Error) -> Error {
    Error::Reconcile {
        path: path.to_path_buf(),
        reason: format!("{} failed: {}", step, e),
    }
}
