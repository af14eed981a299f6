//! Shared append-only JSON-lines logs

use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::record::TelemetryRecord;
use crate::error::{Error, Result};
use crate::storage::{atomic_write, ensure_parent};

/// Default wait for the sidecar lock before an append gives up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Exclusive hold on a log's sidecar lock. The sidecar file is never deleted.
struct SidecarGuard {
    file: File,
}

impl Drop for SidecarGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn sidecar_path(log_path: &Path) -> PathBuf {
    log_path.with_extension("lock")
}

/// Wait for the sidecar lock, polling with jitter until `timeout`
fn lock_sidecar(log_path: &Path, timeout: Duration) -> Result<SidecarGuard> {
    let path = sidecar_path(log_path);
    ensure_parent(&path)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| Error::lock(&path, format!("open failed: {}", e)))?;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(SidecarGuard { file }),
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                if start.elapsed() >= timeout {
                    return Err(Error::lock(
                        &path,
                        format!("still held after {:?}", timeout),
                    ));
                }
                let pause = rand::thread_rng().gen_range(10..50);
                std::thread::sleep(Duration::from_millis(pause));
            }
            Err(e) => return Err(Error::lock(&path, format!("lock failed: {}", e))),
        }
    }
}

/// Append one JSON line to `path`. The caller holds the sidecar lock.
fn write_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Append one JSON line to `log_path` while holding its sidecar lock
pub(crate) fn append_line<T: Serialize>(log_path: &Path, value: &T, timeout: Duration) -> Result<()> {
    let _guard = lock_sidecar(log_path, timeout)?;
    write_line(log_path, value)
}

/// Run a blocking append on the blocking pool so lock waits do not stall the runtime
pub(crate) async fn spawn_append<F>(append: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(append)
        .await
        .map_err(|e| Error::internal(format!("append task failed: {}", e)))?
}

/// Remote requests made for one record, kept apart from the telemetry log so
/// that dedupe never lowers the daily count
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageEntry {
    timestamp: DateTime<Utc>,
    worker_index: usize,
    attempts: u32,
}

/// Parse every intact line of a JSON-lines file. Unparseable lines are skipped.
pub(crate) fn read_lines<T: DeserializeOwned>(log_path: &Path) -> Result<Vec<T>> {
    let raw = match fs::read_to_string(log_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("{}:{}: skipping invalid line: {}", log_path.display(), number + 1, e),
        }
    }
    Ok(entries)
}

/// Counts from a dedupe pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub original: usize,
    pub unique: usize,
    pub removed: usize,
    /// Copy of the log taken before rewriting, if it was rewritten
    pub backup: Option<PathBuf>,
}

/// Append-only telemetry log shared by every worker.
///
/// Appends are serialized through a sidecar lock so a record is either fully
/// present or absent. History is kept until [`TelemetryLog::dedupe`] runs.
/// Request counts for quota checks go to a separate usage file next to the
/// log, which dedupe leaves alone.
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
    lock_timeout: Duration,
}

impl TelemetryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usage file holding per-record request counts
    pub fn usage_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "telemetry".to_string());
        self.path.with_file_name(format!("{}_usage.jsonl", stem))
    }

    pub fn append(&self, record: &TelemetryRecord) -> Result<()> {
        let _guard = lock_sidecar(&self.path, self.lock_timeout)?;
        write_line(&self.path, record)?;
        if record.attempts > 0 {
            let usage = UsageEntry {
                timestamp: record.timestamp,
                worker_index: record.worker_index,
                attempts: record.attempts,
            };
            write_line(&self.usage_path(), &usage)?;
        }
        debug!(
            "Logged {}/{} (success: {})",
            record.group_key, record.filename, record.success
        );
        Ok(())
    }

    /// [`TelemetryLog::append`] on the blocking pool
    pub async fn append_async(&self, record: TelemetryRecord) -> Result<()> {
        let log = self.clone();
        spawn_append(move || log.append(&record)).await
    }

    /// Every record in the log, in append order
    pub fn load(&self) -> Result<Vec<TelemetryRecord>> {
        read_lines(&self.path)
    }

    /// Remote requests a worker made on `day` (UTC), read from the usage file
    pub fn attempts_on(&self, worker_index: usize, day: NaiveDate) -> Result<u64> {
        Ok(read_lines::<UsageEntry>(&self.usage_path())?
            .iter()
            .filter(|u| u.worker_index == worker_index && u.timestamp.date_naive() == day)
            .map(|u| u64::from(u.attempts))
            .sum())
    }

    /// Keep only the latest record per `(filename, group_key)`.
    ///
    /// When anything is removed, the current log is first copied to a
    /// timestamped backup and then replaced atomically with the unique
    /// records sorted by timestamp.
    pub fn dedupe(&self) -> Result<DedupeReport> {
        let _guard = lock_sidecar(&self.path, self.lock_timeout)?;

        let records = self.load()?;
        let unique = latest_per_key(&records);
        let removed = records.len() - unique.len();
        let mut report = DedupeReport {
            original: records.len(),
            unique: unique.len(),
            removed,
            backup: None,
        };

        if removed == 0 {
            info!("No duplicate telemetry records in {}", self.path.display());
            return Ok(report);
        }

        let backup = self.backup_path();
        fs::copy(&self.path, &backup)?;

        let mut body = Vec::new();
        for record in &unique {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        atomic_write(&self.path, &body)?;

        info!(
            "Removed {} duplicate telemetry records ({} -> {}), backup at {}",
            removed,
            records.len(),
            unique.len(),
            backup.display()
        );
        report.backup = Some(backup);
        Ok(report)
    }

    fn backup_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "telemetry".to_string());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        self.path
            .with_file_name(format!("{}_backup_{}.jsonl", stem, stamp))
    }
}

/// Latest record per dedupe key, sorted by timestamp. Ties keep the earlier line.
pub fn latest_per_key(records: &[TelemetryRecord]) -> Vec<TelemetryRecord> {
    let mut latest: HashMap<(String, String), &TelemetryRecord> = HashMap::new();
    for record in records {
        latest
            .entry(record.dedupe_key())
            .and_modify(|kept| {
                if record.timestamp > kept.timestamp {
                    *kept = record;
                }
            })
            .or_insert(record);
    }

    let mut unique: Vec<TelemetryRecord> = latest.into_values().cloned().collect();
    unique.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.dedupe_key().cmp(&b.dedupe_key()))
    });
    unique
}
