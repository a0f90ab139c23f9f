//! Blocking Worker Pool
//!
//! Runs validator and reconciler calls on tokio's blocking threads, at most
//! `size` at a time. A watchdog flags any call that outlives the threshold:
//! the caller gets a retryable [`Error::WatchdogTimeout`], and the path is
//! marked stalled so later calls on it fail fast instead of parking more
//! threads behind the same hung mount.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the blocking worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent blocking calls
    pub size: usize,

    /// Duration after which a single call is flagged as anomalous
    pub watchdog_threshold: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 16,
            watchdog_threshold: Duration::from_secs(5),
        }
    }
}

/// Point-in-time pool usage for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub stalled_paths: Vec<PathBuf>,
}

// =============================================================================
// Pool
// =============================================================================

/// Bounded pool for blocking filesystem calls.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    /// Paths with a call still running past the watchdog threshold
    stalled: Arc<DashMap<PathBuf, Instant>>,
}

impl BlockingPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            config: WorkerPoolConfig { size, ..config },
            stalled: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn is_stalled(&self, path: &Path) -> bool {
        self.stalled.contains_key(path)
    }

    pub fn status(&self) -> PoolStatus {
        let mut stalled_paths: Vec<PathBuf> =
            self.stalled.iter().map(|e| e.key().clone()).collect();
        stalled_paths.sort();
        PoolStatus {
            size: self.config.size,
            available: self.permits.available_permits(),
            stalled_paths,
        }
    }

    /// Run `f` on a blocking thread, bounded by the pool and the watchdog.
    pub async fn run<T, F>(&self, operation: &'static str, path: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(since) = self.stalled.get(path).map(|e| *e.value()) {
            return Err(Error::WatchdogTimeout {
                operation: operation.to_string(),
                path: path.to_path_buf(),
                elapsed: since.elapsed(),
            });
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;

        let started = Instant::now();
        let done = Arc::new(AtomicBool::new(false));
        let key = path.to_path_buf();

        let handle = {
            let done = done.clone();
            let stalled = self.stalled.clone();
            let key = key.clone();
            tokio::task::spawn_blocking(move || {
                let result = f();
                // The slot stays taken until the call really returns
                drop(permit);
                done.store(true, Ordering::SeqCst);
                stalled.remove(&key);
                result
            })
        };

        match tokio::time::timeout(self.config.watchdog_threshold, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Internal(format!(
                "{} on {} panicked: {}",
                operation,
                path.display(),
                join
            ))),
            Err(_) => {
                self.stalled.insert(key.clone(), started);
                if done.load(Ordering::SeqCst) {
                    self.stalled.remove(&key);
                }
                let elapsed = started.elapsed();
                warn!(
                    operation,
                    path = %path.display(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Blocking filesystem call exceeded watchdog threshold"
                );
                metrics::WATCHDOG_ANOMALIES.inc();
                Err(Error::WatchdogTimeout {
                    operation: operation.to_string(),
                    path: key,
                    elapsed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_runs_blocking_call() {
        let pool = BlockingPool::new(WorkerPoolConfig::default());
        let value = pool
            .run("stat", Path::new("/data"), || Ok(42))
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.status().available, 16);
    }

    #[tokio::test]
    async fn test_watchdog_flags_and_fails_fast() {
        let pool = BlockingPool::new(WorkerPoolConfig {
            size: 2,
            watchdog_threshold: Duration::from_millis(50),
        });
        let hung = Path::new("/mnt/nfs-hung");

        let err = pool
            .run("stat", hung, || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::WatchdogTimeout { .. });
        assert!(err.is_retryable());
        assert!(pool.is_stalled(hung));

        // Same path fails fast without taking another slot
        let err = pool.run("stat", hung, || Ok(())).await.unwrap_err();
        assert_matches!(err, Error::WatchdogTimeout { .. });
        assert_eq!(pool.status().available, 1);

        // Other paths keep working
        pool.run("stat", Path::new("/data"), || Ok(()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!pool.is_stalled(hung));
        assert_eq!(pool.status().available, 2);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = BlockingPool::new(WorkerPoolConfig {
            size: 2,
            watchdog_threshold: Duration::from_secs(5),
        });
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let path = PathBuf::from(format!("/data/{}", i));
                pool.run("stat", &path, move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
