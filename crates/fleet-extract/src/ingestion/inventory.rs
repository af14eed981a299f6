//! Work inventory enumeration

use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::WorkItem;

/// Enumerates `<input_root>/<group_key>/<file>` into work items
pub struct Inventory;

impl Inventory {
    /// Scan `input_root` one level deep.
    ///
    /// Each sub-directory is a group and each file in it whose extension is in
    /// `extensions` (case-insensitive) is an item. Hidden entries and files at
    /// the root are ignored. Items come back sorted by `(group_key, item_id)`.
    pub fn scan(input_root: &Path, extensions: &[String]) -> Result<Vec<WorkItem>> {
        let groups = fs::read_dir(input_root).map_err(|e| {
            Error::Config(format!("Cannot read input root {}: {}", input_root.display(), e))
        })?;

        let mut items = Vec::new();
        for group in groups {
            let group = group?;
            let group_key = group.file_name().to_string_lossy().to_string();
            if is_hidden(&group_key) {
                continue;
            }
            if !group.file_type()?.is_dir() {
                debug!("Ignoring {} outside any group", group.path().display());
                continue;
            }

            for entry in fs::read_dir(group.path())? {
                let entry = entry?;
                let item_id = entry.file_name().to_string_lossy().to_string();
                let path = entry.path();
                if is_hidden(&item_id) || !has_extension(&path, extensions) {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(metadata) if metadata.is_file() => metadata,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Skipping {}: {}", path.display(), e);
                        continue;
                    }
                };
                items.push(WorkItem::new(group_key.clone(), item_id, path, metadata.len()));
            }
        }

        items.sort_by(|a, b| a.cmp_order(b));
        debug!("Inventory: {} items under {}", items.len(), input_root.display());
        Ok(items)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
