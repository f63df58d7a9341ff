//! Best-effort advisory locks
//!
//! Writes take a short-lived lock on their hash to cut down on two workers
//! compressing and storing the same payload at once. This is a race-reduction
//! heuristic only: a writer that cannot get the lock in time gives up, and
//! nothing else in the cache relies on it for correctness.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::CacheError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Keyed mutual exclusion with a bounded wait.
#[async_trait]
pub trait Lock: Send + Sync + 'static {
    /// Try to take the lock for `key`, waiting at most `timeout`.
    async fn acquire(&self, key: &str, timeout: Duration) -> bool;

    /// Release the lock for `key`. Releasing a lock that is not held is a no-op.
    fn release(&self, key: &str);
}

/// Holds a lock until dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn Lock,
    key: String,
}

impl<'a> LockGuard<'a> {
    pub async fn acquire(
        lock: &'a dyn Lock,
        key: &str,
        timeout: Duration,
    ) -> Result<LockGuard<'a>, CacheError> {
        if lock.acquire(key, timeout).await {
            Ok(LockGuard {
                lock,
                key: key.to_owned(),
            })
        } else {
            Err(CacheError::LockTimeout {
                key: key.to_owned(),
            })
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

/// Wait until `deadline`, polling. Returns false once the deadline has passed.
async fn wait_for_retry(deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    true
}

/// Lock files in a shared scope directory.
///
/// Works across processes on one host. Locks are `flock`-style advisory locks
/// held on an open handle, so the OS drops them when the holder exits, even
/// if it never released them. Lock files stay on disk between uses.
#[derive(Debug)]
pub struct FileLock {
    dir: PathBuf,
    held: Mutex<HashMap<String, File>>,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.lock", seahash::hash(key.as_bytes())))
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl Lock for FileLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let path = self.lock_path(key);

        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Cannot create lock directory {}: {}", self.dir.display(), e);
            return false;
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot open lock file {}: {}", path.display(), e);
                return false;
            }
        };

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock for {}", key);
                    self.held
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(key.to_owned(), file);
                    return true;
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => {
                    warn!("Cannot lock {}: {}", path.display(), e);
                    return false;
                }
            }

            if !wait_for_retry(deadline).await {
                debug!("Timed out waiting for lock on {}", key);
                return false;
            }
        }
    }

    fn release(&self, key: &str) {
        let file = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        if let Some(file) = file {
            match FileExt::unlock(&file) {
                Ok(()) => debug!("Released lock for {}", key),
                // Closing the handle below releases it regardless
                Err(e) => warn!("Cannot unlock {}: {}", self.lock_path(key).display(), e),
            }
        }
    }
}

/// Locks shared by the tasks of one process
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<HashSet<String>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, key: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(key.to_owned())
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_take(key) {
                return true;
            }
            if !wait_for_retry(deadline).await {
                return false;
            }
        }
    }

    fn release(&self, key: &str) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_lock_excludes_second_holder() {
        let lock = LocalLock::new();
        assert!(lock.acquire("h", Duration::from_millis(10)).await);
        assert!(!lock.acquire("h", Duration::from_millis(60)).await);
        // Other keys are independent
        assert!(lock.acquire("other", Duration::ZERO).await);

        lock.release("h");
        assert!(lock.acquire("h", Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_local_lock_waiter_gets_released_lock() {
        let lock = Arc::new(LocalLock::new());
        assert!(lock.acquire("h", Duration::ZERO).await);

        let releaser = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                lock.release("h");
            })
        };

        assert!(lock.acquire("h", Duration::from_secs(2)).await);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let lock = LocalLock::new();
        {
            let _guard = LockGuard::acquire(&lock, "h", Duration::ZERO)
                .await
                .unwrap();
            assert!(lock.is_held("h"));
            assert!(matches!(
                LockGuard::acquire(&lock, "h", Duration::ZERO).await,
                Err(CacheError::LockTimeout { .. })
            ));
        }
        assert!(!lock.is_held("h"));
    }

    #[tokio::test]
    async fn test_file_lock_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("locks"));

        assert!(lock.acquire("u42", Duration::ZERO).await);
        assert!(lock.lock_path("u42").exists());
        assert!(!lock.acquire("u42", Duration::from_millis(60)).await);

        lock.release("u42");
        assert!(lock.acquire("u42", Duration::ZERO).await);

        // Releasing twice is harmless
        lock.release("u42");
        lock.release("u42");
    }

    #[tokio::test]
    async fn test_file_lock_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLock::new(dir.path());
        let b = FileLock::new(dir.path());

        assert!(a.acquire("u42", Duration::ZERO).await);
        assert!(!b.acquire("u42", Duration::from_millis(60)).await);
        a.release("u42");
        assert!(b.acquire("u42", Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_file_lock_freed_when_holder_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let holder = FileLock::new(dir.path());
        let waiter = FileLock::new(dir.path());

        assert!(holder.acquire("u42", Duration::ZERO).await);
        // Never released; dropping the handles is what a crashed process does
        drop(holder);

        assert!(waiter.acquire("u42", Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_file_lock_gives_up_on_unusable_lock_path() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path());
        std::fs::create_dir(lock.lock_path("u42")).unwrap();

        let started = Instant::now();
        let acquired = tokio::time::timeout(
            Duration::from_secs(3),
            lock.acquire("u42", Duration::from_millis(100)),
        )
        .await
        .expect("acquire must respect its own timeout");

        assert!(!acquired);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_file_lock_waiter_gets_released_lock() {
        let dir = tempfile::tempdir().unwrap();
        let holder = Arc::new(FileLock::new(dir.path()));
        let waiter = FileLock::new(dir.path());
        assert!(holder.acquire("u42", Duration::ZERO).await);

        let releaser = {
            let holder = Arc::clone(&holder);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                holder.release("u42");
            })
        };

        assert!(waiter.acquire("u42", Duration::from_secs(2)).await);
        releaser.await.unwrap();
    }
}
