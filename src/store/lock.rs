//! Advisory cross-process file locks
//!
//! A lock on `path` is the side file `path.lock`, created with `create_new` so
//! that only one holder (thread or process) can succeed. The holder writes its
//! pid into the side file; a contender that finds the recorded pid dead removes
//! the side file and retries immediately.
//!
//! Locks are not re-entrant. Acquiring the same path twice from one logical
//! operation waits on itself until the timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{AppError, Result};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Contents of a lock side file
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl LockManager {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Side file guarding `path`
    pub fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock on `path`, waiting up to the configured timeout.
    pub async fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let lock_path = Self::lock_path(path);
        let start = Instant::now();

        loop {
            match try_create(&lock_path) {
                Ok(()) => {
                    tracing::trace!(path = %lock_path.display(), "Lock acquired");
                    return Ok(LockGuard {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(&lock_path) {
                        continue;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Parent directory is missing
                    if let Some(parent) = lock_path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                        continue;
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= self.timeout {
                return Err(AppError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: start.elapsed().as_millis(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Remove the side file when its owner is gone. Returns true if removed.
    fn reclaim_if_stale(&self, lock_path: &Path) -> bool {
        let owner = std::fs::read_to_string(lock_path)
            .ok()
            .and_then(|s| serde_json::from_str::<LockOwner>(&s).ok());

        let stale = match owner {
            Some(owner) => !pid_alive(owner.pid),
            // The owner may be between create and write; only an old
            // unreadable marker is treated as abandoned.
            None => lock_age(lock_path).is_some_and(|age| age >= self.timeout),
        };

        if !stale {
            return false;
        }

        match std::fs::remove_file(lock_path) {
            Ok(()) => {
                tracing::warn!(path = %lock_path.display(), "Removed stale lock");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %lock_path.display(), "Failed to remove stale lock: {}", e);
                false
            }
        }
    }
}

/// Held lock. Released explicitly or when dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Delete the side file. A missing side file is not an error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_lock_file(&self.lock_path).map_err(Into::into)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_lock_file(&self.lock_path) {
                tracing::warn!(path = %self.lock_path.display(), "Failed to release lock: {}", e);
            }
        }
    }
}

fn remove_lock_file(lock_path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(lock_path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn try_create(lock_path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;

    let owner = LockOwner {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let content = serde_json::to_vec(&owner)?;
    file.write_all(&content)?;
    Ok(())
}

fn lock_age(lock_path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(lock_path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Check whether a process with the given pid exists
pub(crate) fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        let result = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        matches!(result, Ok(s) if s.success())
    }
    #[cfg(not(unix))]
    {
        true
    }
}
