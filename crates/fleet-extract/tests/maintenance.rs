//! Merge, dedupe and summary passes over worker output

mod common;

use chrono::Utc;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{fleet, write_inventory, ScriptedExtractor};
use fleet_extract::storage::{read_rows, AcquireResult, ShardMerger};
use fleet_extract::telemetry::{latest_per_key, Summary, TelemetryLog};
use fleet_extract::{ExtractionWorker, FleetConfig, IdempotencyLedger, LockManager, WorkPartitioner};

async fn run_fleet(config: &FleetConfig, workers: usize) {
    let items = write_inventory(config, 3);
    let extractor = Arc::new(ScriptedExtractor::succeeding());
    for index in 0..workers {
        let partitioner = WorkPartitioner::new(index, workers).unwrap();
        ExtractionWorker::new(config, partitioner, extractor.clone(), 0)
            .unwrap()
            .run(&items)
            .await;
    }
}

fn merger(config: &FleetConfig) -> ShardMerger {
    ShardMerger::new(config.schema.build().unwrap(), 3, Duration::from_millis(1))
}

#[tokio::test]
async fn test_merge_twice_adds_nothing() {
    let (_dir, config) = fleet();
    run_fleet(&config, 2).await;

    let shards = ShardMerger::discover_shards(&config.paths.shard_dir).unwrap();
    assert_eq!(shards.len(), 2);

    let first = merger(&config).merge(&shards, &config.paths.store_path).unwrap();
    assert_eq!(first.added, 9);
    assert_eq!(first.store_rows, 9);
    let before = std::fs::read(&config.paths.store_path).unwrap();

    let second = merger(&config).merge(&shards, &config.paths.store_path).unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.already_merged, 9);
    assert!(!second.rewritten);
    assert_eq!(std::fs::read(&config.paths.store_path).unwrap(), before);
}

#[tokio::test]
async fn test_rerun_then_merge_keeps_store_identical() {
    let (_dir, config) = fleet();
    run_fleet(&config, 3).await;
    let shards = ShardMerger::discover_shards(&config.paths.shard_dir).unwrap();
    merger(&config).merge(&shards, &config.paths.store_path).unwrap();
    let before = std::fs::read(&config.paths.store_path).unwrap();

    run_fleet(&config, 3).await;
    let shards = ShardMerger::discover_shards(&config.paths.shard_dir).unwrap();
    let report = merger(&config).merge(&shards, &config.paths.store_path).unwrap();

    assert_eq!(report.added, 0);
    assert_eq!(std::fs::read(&config.paths.store_path).unwrap(), before);

    let schema = config.schema.build().unwrap();
    let rows = read_rows(&config.paths.store_path, &schema).unwrap();
    assert_eq!(rows.len(), 9);
    assert_eq!(rows[0].fields["wage_information"], "scale A\nscale B");
}

#[tokio::test]
async fn test_dedupe_after_forced_rerun() {
    let (_dir, config) = fleet();
    run_fleet(&config, 1).await;

    // Forget one item's output so the next run redoes it
    let ledger = IdempotencyLedger::new(&config.paths.output_root);
    let key = fleet_extract::ItemKey::new("20", "cao_1.pdf");
    std::fs::remove_file(ledger.output_path(&key)).unwrap();
    run_fleet(&config, 1).await;

    let log = TelemetryLog::new(&config.paths.telemetry_log);
    let records = log.load().unwrap();
    assert_eq!(records.len(), 10);
    let latest = records
        .iter()
        .filter(|r| r.group_key == "20" && r.filename == "cao_1.pdf")
        .map(|r| r.timestamp)
        .max()
        .unwrap();

    let report = log.dedupe().unwrap();
    assert_eq!(report.removed, 1);
    assert!(report.backup.unwrap().exists());

    let records = log.load().unwrap();
    assert_eq!(records.len(), 9);
    let kept = records
        .iter()
        .find(|r| r.group_key == "20" && r.filename == "cao_1.pdf")
        .unwrap();
    assert_eq!(kept.timestamp, latest);
}

#[tokio::test]
async fn test_summary_over_fleet_run() {
    let (_dir, config) = fleet();
    run_fleet(&config, 2).await;

    let records = TelemetryLog::new(&config.paths.telemetry_log).load().unwrap();
    let summary = Summary::compute(&latest_per_key(&records), 100, Utc::now()).with_progress(18);
    summary.write(&config.paths.summary_path).unwrap();

    assert_eq!(summary.successful, 9);
    assert_eq!(summary.total_resource_units, 9 * 1200);
    assert_eq!(summary.requests_today, 9);
    assert_eq!(summary.requests_remaining_today, 91);
    let progress = summary.progress.unwrap();
    assert_eq!(progress.remaining_items, 9);
    assert_eq!(progress.progress_percent, 50.0);
    assert!(config.paths.summary_path.exists());
}

#[test]
fn test_concurrent_acquire_has_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("1/cao.pdf.json");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let output = output.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let locks = LockManager::new(worker, Duration::from_secs(600));
                barrier.wait();
                let result = locks.try_acquire(&output).unwrap();
                // Hold any token until every thread has tried
                barrier.wait();
                matches!(result, AcquireResult::Acquired(_))
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}
