//! Host Filesystem Adapter
//!
//! Implements the `HostFilesystem` port with blocking `std::fs` calls.

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::domain::ports::HostFilesystem;
use crate::volume::validator::DEFAULT_DIRECTORY_MODE;
use crate::volume::{Ownership, PathKind};

/// Filesystem of the node the agent runs on.
#[derive(Debug, Clone, Default)]
pub struct StdHostFilesystem;

impl StdHostFilesystem {
    pub fn new() -> Self {
        Self
    }

    fn create_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => DirBuilder::new()
                .recursive(true)
                .mode(DEFAULT_DIRECTORY_MODE)
                .create(parent),
            _ => Ok(()),
        }
    }
}

/// Map a file type onto the kinds the engine distinguishes.
pub fn kind_of(file_type: &fs::FileType) -> PathKind {
    if file_type.is_dir() {
        PathKind::Directory
    } else if file_type.is_file() {
        PathKind::File
    } else if file_type.is_socket() {
        PathKind::Socket
    } else if file_type.is_char_device() {
        PathKind::CharDevice
    } else if file_type.is_block_device() {
        PathKind::BlockDevice
    } else {
        PathKind::Other
    }
}

impl HostFilesystem for StdHostFilesystem {
    fn stat(&self, path: &Path) -> io::Result<Option<PathKind>> {
        // metadata() follows symbolic links; a dangling link reports NotFound
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(kind_of(&meta.file_type()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_directory(&self, path: &Path, mode: u32) -> io::Result<()> {
        Self::create_parent(path)?;
        DirBuilder::new().mode(mode).create(path)?;
        // The process umask may have masked bits off
        fs::set_permissions(path, Permissions::from_mode(mode))
    }

    fn create_file(&self, path: &Path, mode: u32) -> io::Result<()> {
        Self::create_parent(path)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        fs::set_permissions(path, Permissions::from_mode(mode))
    }

    fn set_owner(&self, path: &Path, owner: Ownership) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_reports_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let fs_port = StdHostFilesystem::new();

        assert_eq!(fs_port.stat(dir.path()).unwrap(), Some(PathKind::Directory));
        assert_eq!(fs_port.stat(&file).unwrap(), Some(PathKind::File));
        assert_eq!(fs_port.stat(&dir.path().join("missing")).unwrap(), None);
        assert_eq!(
            fs_port.stat(Path::new("/dev/null")).unwrap(),
            Some(PathKind::CharDevice)
        );
    }

    #[test]
    fn test_create_directory_with_parents_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let fs_port = StdHostFilesystem::new();

        fs_port.create_directory(&target, 0o750).unwrap();

        let meta = fs::metadata(&target).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);

        let err = fs_port.create_directory(&target, 0o750).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_create_file_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/app.log");
        let fs_port = StdHostFilesystem::new();

        fs_port.create_file(&target, 0o644).unwrap();
        let meta = fs::metadata(&target).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 0);
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);

        let err = fs_port.create_file(&target, 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
