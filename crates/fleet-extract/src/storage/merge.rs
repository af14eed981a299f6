//! Consolidation of per-worker shards into the store

use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::fsutil::atomic_write;
use super::lock::{AcquireResult, LockManager};
use super::shard::{encode_rows, read_rows, read_store_rows, ShardRow, ShardSchema};
use crate::error::{Error, Result};
use crate::types::ItemKey;

/// Counts from one merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub shards: usize,
    pub rows_read: usize,
    /// Rows whose payload was entirely blank
    pub blank_dropped: usize,
    /// Rows whose key was already in the store
    pub already_merged: usize,
    /// Rows whose key appeared in an earlier shard of this pass
    pub duplicates: usize,
    pub added: usize,
    /// Store size after the pass
    pub store_rows: usize,
    /// Whether the store file was replaced
    pub rewritten: bool,
}

/// Merges shards into the consolidated store.
///
/// Keys already in the store are never replaced. Among shards, the first
/// occurrence in sorted path order wins. The store is replaced atomically and
/// a concurrent merge on the same store fails fast.
#[derive(Debug, Clone)]
pub struct ShardMerger {
    schema: ShardSchema,
    max_attempts: u32,
    backoff: Duration,
    locks: LockManager,
}

impl ShardMerger {
    pub fn new(schema: ShardSchema, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            schema,
            max_attempts: max_attempts.max(1),
            backoff,
            locks: LockManager::new(0, Duration::from_secs(900)),
        }
    }

    /// Age after which an abandoned merge lock is reclaimed
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.locks = LockManager::new(0, stale_after);
        self
    }

    /// Shard files in `shard_dir`, sorted by path
    pub fn discover_shards(shard_dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(shard_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut shards = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_shard = path.is_file()
                && path.extension().map(|e| e == "csv").unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("shard_"))
                    .unwrap_or(false);
            if is_shard {
                shards.push(path);
            }
        }
        shards.sort();
        Ok(shards)
    }

    /// Merge `shard_paths` into `store_path`.
    ///
    /// Fails without touching the store when any stored row does not parse.
    pub fn merge(&self, shard_paths: &[PathBuf], store_path: &Path) -> Result<MergeReport> {
        let _guard = match self.locks.try_acquire(store_path)? {
            AcquireResult::Acquired(token) => token,
            AcquireResult::Busy(holder) => {
                let by = holder
                    .map(|l| format!(" (pid {})", l.pid))
                    .unwrap_or_default();
                return Err(Error::lock(
                    LockManager::lock_path(store_path),
                    format!("another merge is already running{}", by),
                ));
            }
        };

        let existing = read_store_rows(store_path, &self.schema)?;
        let store_exists = store_path.is_file();
        let existing_keys: HashSet<ItemKey> = existing.iter().map(ShardRow::key).collect();

        let mut sorted: Vec<&PathBuf> = shard_paths.iter().collect();
        sorted.sort();

        let mut report = MergeReport {
            shards: sorted.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut incoming = Vec::new();

        for shard in sorted {
            for row in read_rows(shard, &self.schema)? {
                report.rows_read += 1;
                let key = row.key();
                if row.is_blank() {
                    report.blank_dropped += 1;
                } else if existing_keys.contains(&key) {
                    report.already_merged += 1;
                } else if !seen.insert(key) {
                    report.duplicates += 1;
                } else {
                    incoming.push(row);
                }
            }
        }

        report.added = incoming.len();
        report.store_rows = existing.len() + incoming.len();

        if incoming.is_empty() && store_exists {
            info!("Merge found nothing new for {}", store_path.display());
            return Ok(report);
        }

        let bytes = encode_rows(&self.schema, existing.iter().chain(incoming.iter()))?;
        self.replace_with_retry(store_path, &bytes)?;
        report.rewritten = true;

        info!(
            "Merged {} new rows into {} ({} total, {} blank, {} already merged, {} duplicates)",
            report.added,
            store_path.display(),
            report.store_rows,
            report.blank_dropped,
            report.already_merged,
            report.duplicates
        );
        Ok(report)
    }

    fn replace_with_retry(&self, store_path: &Path, bytes: &[u8]) -> Result<()> {
        let mut attempt = 1;
        loop {
            match atomic_write(store_path, bytes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff * attempt;
                    warn!(
                        "Replacing {} failed (attempt {}/{}): {}; retrying in {:?}",
                        store_path.display(),
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::MergeExhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::ShardWriter;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn schema() -> ShardSchema {
        ShardSchema::new(vec!["wage_information".to_string()], vec![]).unwrap()
    }

    fn row(group: &str, item: &str, wage: &str, worker: usize) -> ShardRow {
        let mut fields = BTreeMap::new();
        fields.insert("wage_information".to_string(), wage.to_string());
        ShardRow {
            group_key: group.to_string(),
            item_id: item.to_string(),
            worker_index: worker,
            extracted_at: "2026-01-01T00:00:00Z".to_string(),
            fields,
        }
    }

    fn merger() -> ShardMerger {
        ShardMerger::new(schema(), 3, Duration::from_millis(1))
    }

    #[test]
    fn test_merge_filters_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let shard_dir = dir.path().join("shards");
        let store = dir.path().join("store.csv");

        let w0 = ShardWriter::for_worker(&shard_dir, 0, schema());
        w0.append(&row("1", "a.pdf", "scale A", 0)).unwrap();
        w0.append(&row("1", "blank.pdf", "Empty", 0)).unwrap();
        let w1 = ShardWriter::for_worker(&shard_dir, 1, schema());
        w1.append(&row("1", "a.pdf", "later copy", 1)).unwrap();
        w1.append(&row("2", "b.pdf", "scale B", 1)).unwrap();

        let shards = ShardMerger::discover_shards(&shard_dir).unwrap();
        assert_eq!(shards.len(), 2);

        let first = merger().merge(&shards, &store).unwrap();
        assert_eq!(first.rows_read, 4);
        assert_eq!(first.blank_dropped, 1);
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.added, 2);
        assert!(first.rewritten);

        let rows = read_rows(&store, &schema()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields["wage_information"], "scale A");

        let second = merger().merge(&shards, &store).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.already_merged, 3);
        assert!(!second.rewritten);
        assert_eq!(read_rows(&store, &schema()).unwrap(), rows);
    }

    #[test]
    fn test_existing_store_rows_win() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("store.csv");
        fs::write(&store, encode_rows(&schema(), &[row("1", "a.pdf", "original", 5)]).unwrap())
            .unwrap();

        let shard = ShardWriter::for_worker(dir.path(), 0, schema());
        shard.append(&row("1", "a.pdf", "rerun", 0)).unwrap();
        shard.append(&row("1", "c.pdf", "new", 0)).unwrap();

        let report = merger()
            .merge(&[shard.path().to_path_buf()], &store)
            .unwrap();
        assert_eq!(report.already_merged, 1);
        assert_eq!(report.store_rows, 2);

        let rows = read_rows(&store, &schema()).unwrap();
        assert_eq!(rows[0].fields["wage_information"], "original");
        assert_eq!(rows[1].item_id, "c.pdf");
    }

    #[test]
    fn test_empty_shard_set_creates_store() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("out/store.csv");
        let report = merger().merge(&[], &store).unwrap();
        assert_eq!(report.store_rows, 0);
        assert!(store.is_file());
    }

    #[test]
    fn test_concurrent_merge_fails_fast() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("store.csv");
        let holder = LockManager::new(7, Duration::from_secs(900));
        let _token = holder.try_acquire(&store).unwrap();

        let err = merger().merge(&[], &store).unwrap_err();
        assert!(matches!(err, Error::Lock { .. }));
    }

    #[test]
    fn test_damaged_store_is_left_alone() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("store.csv");
        let original = "group_key,item_id,worker_index,extracted_at,wage_information\n\
                        1,a.pdf,0,t,kept\n\
                        1,old.pdf,x,t,prior data\n";
        fs::write(&store, original).unwrap();

        let shard = ShardWriter::for_worker(dir.path(), 0, schema());
        shard.append(&row("1", "new.pdf", "fresh", 0)).unwrap();
        shard.append(&row("1", "old.pdf", "rerun", 0)).unwrap();

        let err = merger()
            .merge(&[shard.path().to_path_buf()], &store)
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert_eq!(fs::read_to_string(&store).unwrap(), original);
    }

    #[test]
    fn test_replace_gives_up_after_max_attempts() {
        let dir = tempdir().unwrap();
        // A non-empty directory cannot be replaced by a file
        let store = dir.path().join("store.csv");
        fs::create_dir(&store).unwrap();
        fs::write(store.join("keep.txt"), "old").unwrap();

        let err = merger().replace_with_retry(&store, b"new").unwrap_err();
        assert!(matches!(err, Error::MergeExhausted { attempts: 3, .. }));
        assert_eq!(fs::read_to_string(store.join("keep.txt")).unwrap(), "old");
    }

    #[test]
    fn test_discover_ignores_other_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("shard_1.csv"), "").unwrap();
        fs::write(dir.path().join("shard_0.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("backup.csv"), "").unwrap();

        let shards = ShardMerger::discover_shards(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["shard_0.csv", "shard_1.csv"]);
        assert!(ShardMerger::discover_shards(&dir.path().join("missing")).unwrap().is_empty());
    }
}
