//! Ledger of permanently failed items

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::log::{append_line, read_lines, spawn_append, DEFAULT_LOCK_TIMEOUT};
use super::record::FailureEntry;
use crate::error::Result;

/// Append-only JSON-lines file, one entry per item that could not be extracted.
///
/// Shares the telemetry log's sidecar-lock append discipline. Entries are
/// never rewritten; rerunning a worker replays the listed items because none
/// of them has an output artifact.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    path: PathBuf,
    lock_timeout: Duration,
}

impl FailureLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &FailureEntry) -> Result<()> {
        append_line(&self.path, entry, self.lock_timeout)?;
        debug!("Failure recorded for {}/{}", entry.group_key, entry.item_id);
        Ok(())
    }

    /// [`FailureLedger::append`] on the blocking pool
    pub async fn append_async(&self, entry: FailureEntry) -> Result<()> {
        let ledger = self.clone();
        spawn_append(move || ledger.append(&entry)).await
    }

    pub fn load(&self) -> Result<Vec<FailureEntry>> {
        read_lines(&self.path)
    }
}
