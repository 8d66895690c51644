//! Process-lifetime advisory lock preventing two engine instances from
//! running against the same state directory concurrently.
//!
//! The lock file holds the owning pid. A lock file left behind by a process
//! that is no longer alive (crash, kill -9) is considered stale and may be
//! stolen; a lock held by a live process yields `EngineError::LockConflict`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::process::process_alive;

/// A held engine lock; releases (deletes the lock file) on drop.
pub struct EngineLock {
    path: PathBuf,
    released: bool,
}

impl EngineLock {
    /// Acquire the lock at `path` (typically `.loopwork/loopwork.lock`).
    ///
    /// Fails with `EngineError::LockConflict` if the file names a pid that
    /// is still alive; otherwise steals a stale lock or creates a fresh one.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| EngineError::BackendInvalid {
                operation: "lock_create_dir",
                fatal: true,
                source: anyhow::Error::new(source).context("creating lock directory"),
            })?;
        }

        if let Some(holder_pid) = read_pid(&path) {
            if process_alive(holder_pid) {
                return Err(EngineError::LockConflict {
                    lock_path: path,
                    holder_pid,
                });
            }
            tracing::warn!(pid = holder_pid, path = %path.display(), "stealing stale engine lock");
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).map_err(|source| EngineError::BackendInvalid {
            operation: "lock_write",
            fatal: true,
            source: anyhow::Error::new(source).context("writing lock file"),
        })?;

        Ok(Self {
            path,
            released: false,
        })
    }

    /// Release the lock explicitly (also happens on drop).
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        self.do_release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_clears_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopwork.lock");
        let lock = EngineLock::acquire(&path).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn conflicting_lock_held_by_self_pid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopwork.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();

        let err = EngineLock::acquire(&path).unwrap_err();
        assert!(matches!(err, EngineError::LockConflict { .. }));
    }

    #[test]
    fn stale_lock_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopwork.lock");
        // An implausible pid that is (almost certainly) not alive.
        fs::write(&path, "999999999").unwrap();

        let lock = EngineLock::acquire(&path).unwrap();
        let holder: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(holder, std::process::id());
        lock.release();
    }
}
