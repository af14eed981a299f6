//! Fleet extraction CLI
//!
//! Run one worker per process:
//! `fleet-extract run-worker --worker-index 0 --total-workers 4`

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_extract::ingestion::Inventory;
use fleet_extract::storage::{IdempotencyLedger, ShardMerger};
use fleet_extract::telemetry::{latest_per_key, FailureLedger, Summary, TelemetryLog};
use fleet_extract::{ExtractionWorker, FleetConfig, GeminiExtractor, SetupError, WorkPartitioner};

#[derive(Parser)]
#[command(name = "fleet-extract", version, about = "Filesystem-coordinated extraction workers")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process this worker's share of the inventory
    RunWorker {
        #[arg(long)]
        worker_index: usize,
        #[arg(long)]
        total_workers: usize,
        /// Daily request budget for this worker (0 for none)
        #[arg(long)]
        quota: Option<u64>,
        /// API key number, read from `<prefix><n>`
        #[arg(long, default_value_t = 1)]
        api_key: u32,
    },
    /// Merge worker shards into the consolidated store
    MergeShards,
    /// Keep only the latest telemetry record per item
    DedupeTelemetry,
    /// Write the summary artifact and print it
    Summarize {
        /// Item count to estimate progress against
        #[arg(long)]
        target: Option<usize>,
    },
    /// Show completed items per group
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_extract=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        let code = if e.downcast_ref::<SetupError>().is_some() { 2 } else { 1 };
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = FleetConfig::load(cli.config.as_deref()).map_err(SetupError::from)?;

    match cli.command {
        Command::RunWorker {
            worker_index,
            total_workers,
            quota,
            api_key,
        } => {
            run_worker(&config, worker_index, total_workers, quota, api_key).await?;
        }
        Command::MergeShards => merge_shards(&config)?,
        Command::DedupeTelemetry => {
            let report = TelemetryLog::new(&config.paths.telemetry_log).dedupe()?;
            println!(
                "Telemetry: {} records, {} unique, {} removed",
                report.original, report.unique, report.removed
            );
            if let Some(backup) = report.backup {
                println!("Backup: {}", backup.display());
            }
        }
        Command::Summarize { target } => summarize(&config, target)?,
        Command::Status => status(&config)?,
    }
    Ok(())
}

async fn run_worker(
    config: &FleetConfig,
    worker_index: usize,
    total_workers: usize,
    quota: Option<u64>,
    api_key: u32,
) -> Result<(), SetupError> {
    let partitioner = WorkPartitioner::new(worker_index, total_workers)?;
    let (key, key_number) = config.resolve_api_key(api_key)?;
    tracing::info!(
        "Worker {}/{} using API key {}",
        worker_index,
        total_workers,
        key_number
    );

    let extractor = GeminiExtractor::new(config.gemini.clone(), key)
        .map_err(|e| SetupError::Config(e.to_string()))?;
    let items = Inventory::scan(&config.paths.input_root, &config.validation.extensions)?;

    let quota = quota.unwrap_or(config.quota.worker_quota);
    let worker = ExtractionWorker::new(config, partitioner, Arc::new(extractor), quota)?;
    let tally = worker.run(&items).await;

    println!("{}", tally);
    for failure in &tally.item_errors {
        println!(
            "  {}/{}: {} ({})",
            failure.group_key, failure.item_id, failure.outcome, failure.error
        );
    }
    Ok(())
}

fn merge_shards(config: &FleetConfig) -> anyhow::Result<()> {
    let schema = config.schema.build().map_err(SetupError::from)?;
    let shards = ShardMerger::discover_shards(&config.paths.shard_dir)?;
    if shards.is_empty() {
        println!("No shards found in {}", config.paths.shard_dir.display());
        return Ok(());
    }

    let merger = ShardMerger::new(
        schema,
        config.merge.max_attempts,
        Duration::from_millis(config.merge.backoff_ms),
    )
    .with_stale_after(Duration::from_secs(config.locks.stale_after_secs));
    let report = merger
        .merge(&shards, &config.paths.store_path)
        .with_context(|| format!("merge into {} failed", config.paths.store_path.display()))?;

    println!(
        "Merged {} shards: {} rows read, {} added, {} already merged, {} duplicates, {} blank",
        report.shards,
        report.rows_read,
        report.added,
        report.already_merged,
        report.duplicates,
        report.blank_dropped
    );
    println!(
        "Store {} now has {} rows",
        config.paths.store_path.display(),
        report.store_rows
    );
    Ok(())
}

fn summarize(config: &FleetConfig, target: Option<usize>) -> anyhow::Result<()> {
    let records = TelemetryLog::new(&config.paths.telemetry_log).load()?;
    let unique = latest_per_key(&records);

    let mut summary = Summary::compute(&unique, config.quota.daily_ceiling, Utc::now());
    if let Some(target) = target {
        summary = summary.with_progress(target);
    }
    summary.write(&config.paths.summary_path)?;

    print!("{}", summary);
    println!("Summary written to {}", config.paths.summary_path.display());
    Ok(())
}

fn status(config: &FleetConfig) -> anyhow::Result<()> {
    let items = Inventory::scan(&config.paths.input_root, &config.validation.extensions)
        .map_err(SetupError::from)?;
    let ledger = IdempotencyLedger::new(&config.paths.output_root);

    let mut groups: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for item in &items {
        let entry = groups.entry(item.group_key.as_str()).or_default();
        entry.1 += 1;
        if ledger.is_done(&item.key()) {
            entry.0 += 1;
        }
    }

    for (group, (done, total)) in &groups {
        println!("  {}: {}/{}", group, done, total);
    }
    let done: usize = groups.values().map(|(done, _)| done).sum();
    println!("Done: {}/{} items in {} groups", done, items.len(), groups.len());

    let failures = FailureLedger::new(&config.paths.failure_ledger).load()?;
    println!("Failure ledger: {} entries", failures.len());
    Ok(())
}
