//! In-Memory Filesystem
//!
//! `HostFilesystem` double used by tests and dry runs. All mutations happen
//! under one lock, so a create is atomic the way `mkdir(2)` is.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::domain::ports::HostFilesystem;
use crate::volume::{Ownership, PathKind};

/// Symbolic link hops before giving up, like ELOOP.
const MAX_LINK_HOPS: usize = 40;

/// A path known to the in-memory filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub kind: PathKind,
    /// Set only for paths created through the port
    pub mode: Option<u32>,
    pub owner: Option<Ownership>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<PathBuf, MemoryEntry>,
    links: HashMap<PathBuf, PathBuf>,
    denied: HashSet<PathBuf>,
    create_error: Option<io::ErrorKind>,
    stat_delay: Option<Duration>,
    path_delays: HashMap<PathBuf, Duration>,
}

/// In-memory filesystem with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryFilesystem {
    state: Mutex<MemoryState>,
    stats: AtomicUsize,
    creations: AtomicUsize,
}

impl InMemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a pre-existing path of `kind`.
    pub fn insert(&self, path: impl Into<PathBuf>, kind: PathKind) {
        self.state.lock().entries.insert(
            path.into(),
            MemoryEntry {
                kind,
                mode: None,
                owner: None,
            },
        );
    }

    /// Remove a path, as an operator would out-of-band.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock();
        state.entries.remove(path.as_ref());
        state.links.remove(path.as_ref());
    }

    /// Create a symbolic link `link -> target`.
    pub fn symlink(&self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state.lock().links.insert(link.into(), target.into());
    }

    /// Make status queries on `path` fail with permission denied.
    pub fn deny(&self, path: impl Into<PathBuf>) {
        self.state.lock().denied.insert(path.into());
    }

    pub fn allow(&self, path: impl AsRef<Path>) {
        self.state.lock().denied.remove(path.as_ref());
    }

    /// Make every create call fail with `kind` until cleared with `None`.
    pub fn fail_creates(&self, kind: Option<io::ErrorKind>) {
        self.state.lock().create_error = kind;
    }

    /// Make every status query block for `delay`.
    pub fn set_stat_delay(&self, delay: Option<Duration>) {
        self.state.lock().stat_delay = delay;
    }

    /// Make status queries of `path` alone block for `delay`.
    pub fn set_path_delay(&self, path: impl Into<PathBuf>, delay: Duration) {
        self.state.lock().path_delays.insert(path.into(), delay);
    }

    pub fn entry(&self, path: impl AsRef<Path>) -> Option<MemoryEntry> {
        self.state.lock().entries.get(path.as_ref()).cloned()
    }

    /// Number of status queries served.
    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    /// Number of successful create calls.
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    fn resolve(state: &MemoryState, path: &Path) -> io::Result<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_LINK_HOPS {
            match state.links.get(&current) {
                Some(target) => current = target.clone(),
                None => return Ok(current),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            "too many levels of symbolic links",
        ))
    }

    fn create(&self, path: &Path, kind: PathKind, mode: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.create_error {
            return Err(io::Error::new(kind, "injected create failure"));
        }
        if state.entries.contains_key(path) || state.links.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "path exists"));
        }

        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
                continue;
            }
            match state.entries.get(ancestor) {
                Some(entry) if entry.kind != PathKind::Directory => {
                    return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
                }
                Some(_) => {}
                None => {
                    state.entries.insert(
                        ancestor.to_path_buf(),
                        MemoryEntry {
                            kind: PathKind::Directory,
                            mode: Some(mode | 0o111),
                            owner: None,
                        },
                    );
                }
            }
        }

        state.entries.insert(
            path.to_path_buf(),
            MemoryEntry {
                kind,
                mode: Some(mode),
                owner: None,
            },
        );
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl HostFilesystem for InMemoryFilesystem {
    fn stat(&self, path: &Path) -> io::Result<Option<PathKind>> {
        self.stats.fetch_add(1, Ordering::SeqCst);

        let delay = {
            let state = self.state.lock();
            state.path_delays.get(path).copied().or(state.stat_delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let state = self.state.lock();
        if state.denied.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission denied",
            ));
        }
        let resolved = Self::resolve(&state, path)?;
        Ok(state.entries.get(&resolved).map(|e| e.kind))
    }

    fn create_directory(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.create(path, PathKind::Directory, mode)
    }

    fn create_file(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.create(path, PathKind::File, mode)
    }

    fn set_owner(&self, path: &Path, owner: Ownership) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.owner = Some(owner);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such path")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_exclusive() {
        let fs = InMemoryFilesystem::new();
        fs.create_directory(Path::new("/data/a"), 0o755).unwrap();

        let err = fs
            .create_directory(Path::new("/data/a"), 0o755)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs.creation_count(), 1);
        assert_eq!(
            fs.stat(Path::new("/data")).unwrap(),
            Some(PathKind::Directory)
        );
    }

    #[test]
    fn test_dangling_link_is_missing_but_blocks_create() {
        let fs = InMemoryFilesystem::new();
        fs.symlink("/data/link", "/nowhere");

        assert_eq!(fs.stat(Path::new("/data/link")).unwrap(), None);
        let err = fs
            .create_directory(Path::new("/data/link"), 0o755)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_injected_failures() {
        let fs = InMemoryFilesystem::new();
        fs.fail_creates(Some(io::ErrorKind::PermissionDenied));
        assert!(fs.create_file(Path::new("/f"), 0o644).is_err());

        fs.fail_creates(None);
        fs.create_file(Path::new("/f"), 0o644).unwrap();
        assert_eq!(fs.entry("/f").unwrap().mode, Some(0o644));
    }
}
