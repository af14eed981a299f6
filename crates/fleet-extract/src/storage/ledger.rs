//! Completion ledger keyed by terminal output artifacts

use std::path::{Path, PathBuf};

use super::fsutil::atomic_write_json;
use crate::error::Result;
use crate::types::ItemKey;

/// An item is done iff its output artifact exists at
/// `<output_root>/<group_key>/<item_id>.json`.
///
/// Artifacts are only ever written atomically, so existence implies a
/// complete artifact.
#[derive(Debug, Clone)]
pub struct IdempotencyLedger {
    output_root: PathBuf,
}

impl IdempotencyLedger {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Deterministic artifact path for an item
    pub fn output_path(&self, key: &ItemKey) -> PathBuf {
        self.output_root
            .join(&key.group_key)
            .join(format!("{}.json", key.item_id))
    }

    pub fn is_done(&self, key: &ItemKey) -> bool {
        self.output_path(key).is_file()
    }

    /// Write the terminal artifact, marking the item done
    pub fn write_output(&self, key: &ItemKey, payload: &serde_json::Value) -> Result<PathBuf> {
        let path = self.output_path(key);
        atomic_write_json(&path, payload)?;
        Ok(path)
    }

    /// Read a completed item's artifact
    pub fn read_output(&self, key: &ItemKey) -> Result<Option<serde_json::Value>> {
        let path = self.output_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// How many of `keys` are done
    pub fn count_done<'a>(&self, keys: impl IntoIterator<Item = &'a ItemKey>) -> usize {
        keys.into_iter().filter(|key| self.is_done(key)).count()
    }
}
