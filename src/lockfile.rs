//! Lock file L: a named file holding an advisory, non-blocking exclusive lock plus
//! the owning process id, used to detect another process (or an unclean shutdown of
//! this one) already holding the store open.
//!
//! Grounded on `fslock::LockFile::open`/`try_lock` as used by
//! `vector-buffers`'s `Ledger::load_or_create` (one lock file per store directory, a
//! `LedgerLockAlreadyHeld`-style failure on contention) -- generalized here with a
//! stale-lock-recovery retry loop, which that code does not need since it never
//! tries to break another process's lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fslock::LockFile;

use crate::error::{Result, StoreError};

pub struct StoreLock {
    inner: LockFile,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock at `path`, retrying up to `max_retries` times with
    /// `pause_secs` between attempts. If a held lock looks stale (older than
    /// `timeout_secs` and its recorded pid is unreachable) it is broken before the
    /// next attempt.
    pub fn acquire(
        path: impl AsRef<Path>,
        timeout_secs: u64,
        max_retries: u32,
        pause_secs: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut attempt = 0u32;
        loop {
            let mut lock = LockFile::open(&path).map_err(|e| StoreError::Lock(e.to_string()))?;
            if lock.try_lock().map_err(|e| StoreError::Lock(e.to_string()))? {
                std::fs::write(&path, std::process::id().to_string())?;
                return Ok(StoreLock { inner: lock, path });
            }
            drop(lock);

            if attempt >= max_retries {
                return Err(StoreError::Lock(format!(
                    "could not acquire lock {} after {max_retries} retries",
                    path.display()
                )));
            }
            attempt += 1;

            if Self::is_stale(&path, timeout_secs)? {
                Self::break_stale_lock(&path)?;
            }
            std::thread::sleep(Duration::from_secs(pause_secs));
        }
    }

    /// Tests file presence only -- it does not attempt to take the lock.
    pub fn is_locked(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    pub fn release(mut self) -> Result<()> {
        self.inner
            .unlock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn read_pid(path: &Path) -> Result<Option<u32>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(s.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(path: &Path, timeout_secs: u64) -> Result<bool> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let age = meta
            .modified()?
            .elapsed()
            .unwrap_or(Duration::from_secs(0));
        if age.as_secs() < timeout_secs {
            return Ok(false);
        }
        match Self::read_pid(path)? {
            Some(pid) => Ok(!Self::pid_is_alive(pid)),
            None => Ok(true),
        }
    }

    #[cfg(unix)]
    fn pid_is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn pid_is_alive(_pid: u32) -> bool {
        // Conservatively assume alive off Unix; there is no portable liveness probe
        // available here without adding a platform-specific dependency.
        true
    }

    #[cfg(unix)]
    fn signal(pid: u32, sig: &str) {
        let _ = std::process::Command::new("kill")
            .arg(format!("-{sig}"))
            .arg(pid.to_string())
            .status();
    }

    #[cfg(not(unix))]
    fn signal(_pid: u32, _sig: &str) {}

    fn break_stale_lock(path: &Path) -> Result<()> {
        if let Some(pid) = Self::read_pid(path)? {
            Self::signal(pid, "TERM");
            std::thread::sleep(Duration::from_millis(200));
            if Self::pid_is_alive(pid) {
                Self::signal(pid, "KILL");
            }
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.inner.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.dirty");
        assert!(!StoreLock::is_locked(&path));
        let lock = StoreLock::acquire(&path, 300, 3, 1).unwrap();
        assert!(StoreLock::is_locked(&path));
        assert_eq!(
            StoreLock::read_pid(&path).unwrap(),
            Some(std::process::id())
        );
        lock.release().unwrap();
    }

    #[test]
    fn second_acquire_on_same_file_within_one_process_fails_fast_without_stale_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.dirty");
        let _held = StoreLock::acquire(&path, 300, 3, 1).unwrap();
        // Our own pid is always "alive", so staleness never kicks in here and every
        // retry just re-fails -- exercises the max_retries exhaustion path.
        let second = StoreLock::acquire(&path, 300, 0, 0);
        assert!(second.is_err());
    }
}
