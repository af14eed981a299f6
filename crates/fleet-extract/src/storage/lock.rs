//! Per-item exclusive locks backed by filesystem artifacts
//!
//! The lock artifact sits next to the item's output (`<output>.lock`). Exclusion
//! comes from a non-blocking advisory lock on the artifact; the JSON lease inside
//! it carries a heartbeat so that artifacts orphaned by a crash can be reclaimed
//! once they go stale.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::fsutil::ensure_parent;
use crate::error::{Error, Result};

/// Attempts to get a stable artifact when a holder releases mid-acquire
const ACQUIRE_RACE_RETRIES: usize = 3;

/// Contents of a lock artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Unique per LockManager instance
    pub owner: String,
    pub worker_index: usize,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockLease {
    /// Whether the last heartbeat is older than `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let age = now.signed_duration_since(self.heartbeat_at);
        age.to_std().map(|age| age > stale_after).unwrap_or(false)
    }
}

/// Outcome of a non-blocking acquire
#[derive(Debug)]
pub enum AcquireResult {
    Acquired(LockToken),
    /// Someone else holds it; carries their lease when it could be read
    Busy(Option<LockLease>),
}

/// Hands out per-item locks for one worker process
#[derive(Debug, Clone)]
pub struct LockManager {
    owner: String,
    worker_index: usize,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(worker_index: usize, stale_after: Duration) -> Self {
        Self {
            owner: format!("worker-{}-{}", worker_index, Uuid::new_v4()),
            worker_index,
            stale_after,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lock artifact path for an output path
    pub fn lock_path(output_path: &Path) -> PathBuf {
        output_path.with_extension("lock")
    }

    /// Try to lock `output_path` without waiting
    pub fn try_acquire(&self, output_path: &Path) -> Result<AcquireResult> {
        let lock_path = Self::lock_path(output_path);
        ensure_parent(&lock_path)?;

        for _ in 0..ACQUIRE_RACE_RETRIES {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| Error::lock(&lock_path, format!("open failed: {}", e)))?;

            if let Err(e) = file.try_lock_exclusive() {
                if is_contended(&e) {
                    debug!("{} is held by another process", lock_path.display());
                    return Ok(AcquireResult::Busy(read_lease(&file).ok().flatten()));
                }
                return Err(Error::lock(&lock_path, format!("lock failed: {}", e)));
            }

            // The previous holder may have deleted the artifact between our open and lock
            if !still_linked(&file, &lock_path)? {
                debug!("{} was replaced while acquiring, retrying", lock_path.display());
                continue;
            }

            let now = Utc::now();
            if let Some(existing) = read_lease(&file)? {
                if existing.owner != self.owner {
                    if !existing.is_stale(now, self.stale_after) {
                        return Ok(AcquireResult::Busy(Some(existing)));
                    }
                    warn!(
                        "Reclaiming stale lock {} from {} (last heartbeat {})",
                        lock_path.display(),
                        existing.owner,
                        existing.heartbeat_at
                    );
                }
            }

            let lease = LockLease {
                owner: self.owner.clone(),
                worker_index: self.worker_index,
                pid: std::process::id(),
                acquired_at: now,
                heartbeat_at: now,
            };
            write_lease(&file, &lease)
                .map_err(|e| Error::lock(&lock_path, format!("lease write failed: {}", e)))?;

            return Ok(AcquireResult::Acquired(LockToken {
                file,
                path: lock_path,
                lease: Mutex::new(lease),
                released: false,
            }));
        }

        Err(Error::lock(&lock_path, "artifact kept changing during acquire"))
    }

    /// Read the lease of an artifact without locking it
    pub fn inspect(output_path: &Path) -> Result<Option<LockLease>> {
        let lock_path = Self::lock_path(output_path);
        match File::open(&lock_path) {
            Ok(file) => read_lease(&file),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held lock. Dropping it releases the lock and deletes the artifact.
#[derive(Debug)]
pub struct LockToken {
    file: File,
    path: PathBuf,
    lease: Mutex<LockLease>,
    released: bool,
}

impl LockToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lease(&self) -> LockLease {
        self.lease.lock().clone()
    }

    /// Refresh the lease heartbeat
    pub fn heartbeat(&self) -> Result<()> {
        let mut lease = self.lease.lock();
        lease.heartbeat_at = Utc::now();
        write_lease(&self.file, &lease)
            .map_err(|e| Error::lock(&self.path, format!("heartbeat failed: {}", e)))
    }

    /// Release explicitly, surfacing errors that Drop would only log
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Unlink before unlocking so a waiter never locks a live artifact
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::lock(&self.path, format!("remove failed: {}", e))),
        };
        let _ = FileExt::unlock(&self.file);
        removed
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release lock: {}", e);
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

fn read_lease(file: &File) -> Result<Option<LockLease>> {
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;

    if raw.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&raw) {
        Ok(lease) => Ok(Some(lease)),
        Err(e) => {
            // Torn or foreign content counts as no lease
            debug!("Ignoring unreadable lease: {}", e);
            Ok(None)
        }
    }
}

fn write_lease(file: &File, lease: &LockLease) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(lease).map_err(std::io::Error::from)?;
    let mut writer = file;
    file.set_len(0)?;
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&bytes)?;
    file.sync_data()
}
