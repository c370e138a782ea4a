//! JSON record files with crash-safe replace and corruption quarantine
//!
//! Every mutation goes through a [`LockedFile`]: the lock on the target is
//! held for the whole read-modify-write span and the new contents land via a
//! uniquely named temporary sibling renamed over the target.
//!
//! A file that fails to parse is copied to `<file>.corrupted.<timestamp>` and
//! treated as empty (arrays) or absent (objects). The parse error never
//! reaches the caller.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::lock::{LockGuard, LockManager};
use crate::error::Result;

/// Outcome of reading raw file contents
enum Raw<T> {
    Missing,
    Parsed(T),
    Corrupted(serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    locks: LockManager,
}

impl RecordStore {
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Begin a locked transaction on `path`
    pub async fn lock(&self, path: impl AsRef<Path>) -> Result<LockedFile> {
        let path = path.as_ref().to_path_buf();
        let guard = self.locks.acquire(&path).await?;
        Ok(LockedFile { path, guard })
    }

    /// Read an array file. A missing file is materialized as `[]`; a corrupted
    /// one is quarantined and reset to `[]`.
    pub async fn read_array<T>(&self, path: impl AsRef<Path>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Serialize,
    {
        let path = path.as_ref();
        match read_raw::<Vec<T>>(path).await? {
            Raw::Parsed(items) => Ok(items),
            Raw::Missing | Raw::Corrupted(_) => {
                // Re-check under the lock; another writer may have fixed it
                let file = self.lock(path).await?;
                let items = file.read_array::<T>().await?;
                if !path.exists() {
                    file.write(&items).await?;
                }
                Ok(items)
            }
        }
    }

    /// Read an object file. Missing and corrupted files both yield `None`.
    pub async fn read_object<T>(&self, path: impl AsRef<Path>) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let path = path.as_ref();
        match read_raw::<T>(path).await? {
            Raw::Parsed(value) => Ok(Some(value)),
            Raw::Missing => Ok(None),
            Raw::Corrupted(e) => {
                quarantine(path, &e).await;
                Ok(None)
            }
        }
    }

    /// Replace the file contents
    pub async fn write<T: Serialize + ?Sized>(&self, path: impl AsRef<Path>, value: &T) -> Result<()> {
        let file = self.lock(path).await?;
        file.write(value).await
    }

    /// Read-modify-write an array file under one lock span. Returns the
    /// closure's result after the new contents are in place.
    pub async fn update_array<T, R, F>(&self, path: impl AsRef<Path>, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut Vec<T>) -> Result<R>,
    {
        let file = self.lock(path).await?;
        let mut items = file.read_array::<T>().await?;
        let result = f(&mut items)?;
        file.write(&items).await?;
        Ok(result)
    }

    /// Read-modify-write an object file under one lock span. The closure sees
    /// `None` for a missing or corrupted file; nothing is written when it
    /// leaves the value as `None`.
    pub async fn update_object<T, R, F>(&self, path: impl AsRef<Path>, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize,
        F: FnOnce(&mut Option<T>) -> Result<R>,
    {
        let file = self.lock(path).await?;
        let mut value = file.read_object::<T>().await?;
        let result = f(&mut value)?;
        if let Some(value) = &value {
            file.write(value).await?;
        }
        Ok(result)
    }
}

/// A record file whose lock is held. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockedFile {
    path: PathBuf,
    guard: LockGuard,
}

impl LockedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_array<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        match read_raw::<Vec<T>>(&self.path).await? {
            Raw::Parsed(items) => Ok(items),
            Raw::Missing => Ok(Vec::new()),
            Raw::Corrupted(e) => {
                quarantine(&self.path, &e).await;
                stage(&self.path, &Vec::<serde_json::Value>::new())
                    .await?
                    .commit()
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    pub async fn read_object<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match read_raw::<T>(&self.path).await? {
            Raw::Parsed(value) => Ok(Some(value)),
            Raw::Missing => Ok(None),
            Raw::Corrupted(e) => {
                quarantine(&self.path, &e).await;
                Ok(None)
            }
        }
    }

    /// Serialize `value` to a temporary sibling without touching the target
    pub async fn stage<T: Serialize + ?Sized>(&self, value: &T) -> Result<StagedWrite> {
        stage(&self.path, value).await
    }

    pub async fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.stage(value).await?.commit().await
    }

    /// Release the lock now instead of on drop
    pub fn release(self) -> Result<()> {
        self.guard.release()
    }
}

/// Serialized contents waiting in a temporary sibling of the target.
///
/// Until [`StagedWrite::commit`] renames it, the target keeps its previous
/// contents.
#[derive(Debug)]
pub struct StagedWrite {
    temp: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub async fn commit(self) -> Result<()> {
        if let Err(e) = tokio::fs::rename(&self.temp, &self.target).await {
            let _ = tokio::fs::remove_file(&self.temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn stage<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<StagedWrite> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp = temp_path(target);
    tokio::fs::write(&temp, bytes).await?;

    Ok(StagedWrite {
        temp,
        target: target.to_path_buf(),
    })
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ))
}

/// Path the corrupted copy of `path` is saved under
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupted.{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
    PathBuf::from(name)
}

async fn read_raw<T: DeserializeOwned>(path: &Path) -> Result<Raw<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Raw::Missing),
        Err(e) => return Err(e.into()),
    };

    Ok(match serde_json::from_slice(&bytes) {
        Ok(value) => Raw::Parsed(value),
        Err(e) => Raw::Corrupted(e),
    })
}

async fn quarantine(path: &Path, error: &serde_json::Error) {
    let backup = backup_path(path);
    match tokio::fs::copy(path, &backup).await {
        Ok(_) => tracing::warn!(
            file = %path.display(),
            backup = %backup.display(),
            "Corrupted record quarantined: {}",
            error
        ),
        Err(e) => tracing::warn!(
            file = %path.display(),
            "Corrupted record could not be backed up ({}): {}",
            e,
            error
        ),
    }
}
