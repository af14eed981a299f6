//! Shared fixtures for worker scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use fleet_extract::config::PacingConfig;
use fleet_extract::providers::{Extraction, Extractor, RemoteError, SourceContent, TokenUsage};
use fleet_extract::{FleetConfig, WorkItem};

/// Extractor that fails according to a script and otherwise succeeds
pub struct ScriptedExtractor {
    failures: Mutex<VecDeque<RemoteError>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn succeeding() -> Self {
        Self::failing_first(Vec::new())
    }

    /// Return each of `failures` in order before succeeding
    pub fn failing_first(failures: Vec<RemoteError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// File names passed to `extract`, one per call
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        source: &SourceContent,
        _timeout: Duration,
    ) -> Result<Extraction, RemoteError> {
        self.calls.lock().push(source.file_name.clone());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(Extraction {
            payload: json!({
                "general_information": format!("summary of {}", source.file_name),
                "wage_information": ["scale A", "scale B"],
                "pension_information": null,
            }),
            usage: TokenUsage {
                input_tokens: 1000,
                output_tokens: 200,
            },
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}

/// Config rooted in `dir` with no pacing and zero backoff
pub fn test_config(dir: &Path) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.paths.input_root = dir.join("input");
    config.paths.output_root = dir.join("output");
    config.paths.shard_dir = dir.join("shards");
    config.paths.store_path = dir.join("results/store.csv");
    config.paths.telemetry_log = dir.join("logs/perf.jsonl");
    config.paths.summary_path = dir.join("logs/summary.json");
    config.paths.failure_ledger = dir.join("logs/failed.jsonl");
    config.retry.timeout_base_secs = 0;
    config.retry.unavailable_base_secs = 0;
    config.retry.rate_limited_base_secs = 0;
    config.retry.other_base_secs = 0;
    config.pacing = PacingConfig {
        after_success_secs: 0,
        after_busy_secs: 0,
        max_items_per_run: 0,
    };
    config.merge.backoff_ms = 1;
    config
}

pub fn fleet() -> (TempDir, FleetConfig) {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path());
    (dir, config)
}

/// Write a PDF-looking source of `size` bytes and return its work item
pub fn write_source(config: &FleetConfig, group: &str, name: &str, size: usize) -> WorkItem {
    let path = config.paths.input_root.join(group).join(name);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.resize(size, b'x');
    std::fs::write(&path, &bytes).expect("write source");
    WorkItem::new(group, name, path, size as u64)
}

/// A small inventory spread over three groups
pub fn write_inventory(config: &FleetConfig, per_group: usize) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for group in ["10", "20", "30"] {
        for i in 0..per_group {
            items.push(write_source(config, group, &format!("cao_{}.pdf", i), 4096));
        }
    }
    items
}
