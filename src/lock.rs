//! Exclusive access to one working tree.
//!
//! Two layers: a process-wide registry of async mutexes keyed by the
//! canonical project root (orchestrators and monitors in one process), and an
//! advisory `fd-lock` file inside the git directory (separate processes).
//! Both are held for exactly the duration of the closure passed to
//! [`WorkingTreeLock::run_exclusive`].

use fd_lock::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::execution::EngineError;

type TreeMutex = Arc<tokio::sync::Mutex<()>>;

static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, TreeMutex>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

const FILE_LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct WorkingTreeLock {
    root: PathBuf,
    lock_file: PathBuf,
    mutex: TreeMutex,
}

impl WorkingTreeLock {
    /// Lock handle for the working tree at `root`; every handle for the same
    /// tree shares one in-process mutex.
    pub fn for_root(root: &Path) -> Self {
        let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mutex = {
            let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
            registry.entry(canonical.clone()).or_default().clone()
        };
        Self {
            lock_file: canonical.join(".git").join("patchkeeper.lock"),
            root: canonical,
            mutex,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `work` while holding the working tree, waiting up to `timeout`.
    pub async fn run_exclusive<F, Fut, T>(&self, timeout: Duration, work: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let deadline = Instant::now() + timeout;

        let _guard = tokio::time::timeout_at(deadline, self.mutex.lock())
            .await
            .map_err(|_| self.busy())?;

        let mut file_lock = self.open_lock_file();
        let _file_guard = match file_lock.as_mut() {
            Some(lock) => {
                while lock.try_write().is_err() {
                    if Instant::now() >= deadline {
                        return Err(self.busy());
                    }
                    tokio::time::sleep(FILE_LOCK_RETRY).await;
                }
                Some(lock.try_write().map_err(|_| self.busy())?)
            }
            None => None,
        };

        debug!(root = %self.root.display(), "Working tree lock acquired");
        Ok(work().await)
    }

    /// Run `work` only if the working tree is free right now.
    pub async fn try_run_exclusive<F, Fut, T>(&self, work: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.mutex.try_lock().map_err(|_| self.busy())?;

        let mut file_lock = self.open_lock_file();
        let _file_guard = match file_lock.as_mut() {
            Some(lock) => Some(lock.try_write().map_err(|_| self.busy())?),
            None => None,
        };

        Ok(work().await)
    }

    pub fn is_held(&self) -> bool {
        self.mutex.try_lock().is_err()
    }

    // Cross-process locking is skipped when the git directory is not writable
    // (or is a worktree file); the in-process mutex still applies.
    fn open_lock_file(&self) -> Option<RwLock<File>> {
        let parent = self.lock_file.parent()?;
        if !parent.is_dir() {
            return None;
        }
        match OpenOptions::new().create(true).truncate(false).write(true).open(&self.lock_file) {
            Ok(file) => Some(RwLock::new(file)),
            Err(e) => {
                warn!(path = %self.lock_file.display(), error = %e, "Could not open working tree lock file");
                None
            }
        }
    }

    fn busy(&self) -> EngineError {
        EngineError::validation(format!("working tree busy: {}", self.root.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn repo_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_handles_for_same_root_share_one_mutex() {
        let dir = repo_dir();
        let a = WorkingTreeLock::for_root(dir.path());
        let b = WorkingTreeLock::for_root(dir.path());

        let inner = a
            .run_exclusive(Duration::from_secs(1), || async { b.is_held() })
            .await
            .unwrap();

        assert!(inner);
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn test_contention_times_out_with_validation_error() {
        let dir = repo_dir();
        let holder = WorkingTreeLock::for_root(dir.path());
        let waiter = WorkingTreeLock::for_root(dir.path());

        let result = holder
            .run_exclusive(Duration::from_secs(1), || async {
                waiter
                    .run_exclusive(Duration::from_millis(100), || async { "ran" })
                    .await
            })
            .await
            .unwrap();

        match result {
            Err(EngineError::Validation { message }) => assert!(message.contains("working tree busy")),
            other => panic!("expected busy error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_try_run_exclusive_never_waits() {
        let dir = repo_dir();
        let holder = WorkingTreeLock::for_root(dir.path());
        let other = WorkingTreeLock::for_root(dir.path());

        let nested = holder
            .run_exclusive(Duration::from_secs(1), || async { other.try_run_exclusive(|| async {}).await })
            .await
            .unwrap();

        assert!(nested.is_err());
        assert!(other.try_run_exclusive(|| async { 7 }).await.unwrap() == 7);
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let dir = repo_dir();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = WorkingTreeLock::for_root(dir.path());
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                lock.run_exclusive(Duration::from_secs(5), || async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_works_without_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WorkingTreeLock::for_root(dir.path());

        let value = lock.run_exclusive(Duration::from_secs(1), || async { 1 }).await.unwrap();

        assert_eq!(value, 1);
        assert!(!dir.path().join(".git").exists());
    }
}
