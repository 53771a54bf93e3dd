//! Advisory cross-process file locking.
//!
//! The on-disk cache and failure ledger are shared by multiple independent
//! processes pointing at the same cache root. An advisory lock on a sentinel
//! file colocated with the ledger serializes ledger rewrites across them; an
//! in-process mutex handles contention within one process.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {path:?}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("lock file error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Advisory lock on a sentinel file.
///
/// Cheap to construct; no file is touched until acquisition.
#[derive(Debug, Clone)]
pub struct CrossProcessLock {
    path: PathBuf,
}

impl CrossProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Callers on read paths pass a short timeout and treat `Timeout` as a
    /// degraded read; write paths pass a long timeout and propagate it.
    pub fn acquire(&self, timeout: Duration) -> Result<FileLockGuard, LockError> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// Single non-blocking acquisition attempt.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>, LockError> {
        imp::try_lock(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Held lock; released on drop on every exit path.
#[derive(Debug)]
pub struct FileLockGuard {
    _file: File,
    #[cfg(not(unix))]
    path: PathBuf,
}

#[cfg(not(unix))]
impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Sentinel-file locking: existence of the file is the lock.
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
mod imp {
    use super::FileLockGuard;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub fn try_lock(path: &Path) -> io::Result<Option<FileLockGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        // flock is released on close, so the guard only needs to keep the
        // file descriptor alive.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(FileLockGuard { _file: file }));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::FileLockGuard;
    use std::io;
    use std::path::Path;

    pub fn try_lock(path: &Path) -> io::Result<Option<FileLockGuard>> {
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
        {
            Ok(file) => Ok(Some(FileLockGuard {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = CrossProcessLock::new(dir.path().join("ledger.lock"));

        let guard = lock.acquire(Duration::from_secs(1)).unwrap();
        drop(guard);

        // Released, so a second acquisition succeeds immediately.
        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
    }

    #[test]
    fn test_contended_try_acquire_fails() {
        let dir = TempDir::new().unwrap();
        let lock = CrossProcessLock::new(dir.path().join("ledger.lock"));
        let other = CrossProcessLock::new(dir.path().join("ledger.lock"));

        let _held = lock.acquire(Duration::from_secs(1)).unwrap();
        assert!(other.try_acquire().unwrap().is_none());
    }

    #[test]
    fn test_acquire_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = CrossProcessLock::new(dir.path().join("ledger.lock"));
        let other = CrossProcessLock::new(dir.path().join("ledger.lock"));

        let _held = lock.acquire(Duration::from_secs(1)).unwrap();
        let err = other.acquire(Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_guard_released_on_panic_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.lock");

        let result = std::panic::catch_unwind({
            let path = path.clone();
            move || {
                let lock = CrossProcessLock::new(path);
                let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
                panic!("boom");
            }
        });
        assert!(result.is_err());

        let lock = CrossProcessLock::new(path);
        assert!(lock.try_acquire().unwrap().is_some());
    }
}
