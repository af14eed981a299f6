//! Extraction worker for one slice of the inventory

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{FleetConfig, PacingConfig, TimeoutConfig};
use crate::error::SetupError;
use crate::ingestion::{FileSignatureValidator, SourceValidator};
use crate::providers::{Extraction, Extractor, RemoteError, SourceContent};
use crate::retry::{ErrorClass, RetryExecutor};
use crate::storage::{AcquireResult, IdempotencyLedger, LockManager, LockToken, ShardRow, ShardSchema, ShardWriter};
use crate::telemetry::{FailureEntry, FailureLedger, TelemetryLog, TelemetryRecord, VALIDATION_CLASS};
use crate::types::{ItemOutcome, WorkItem};

use super::file_tier::{AdvisoryLevel, SourceProfile};
use super::partition::WorkPartitioner;
use super::tally::{RunTally, StopReason};

/// Processes the items assigned to one worker index.
///
/// Each item goes through the ledger check, the per-item lock, source
/// validation and the retried remote call. Item failures are recorded and
/// never abort the run.
pub struct ExtractionWorker {
    partitioner: WorkPartitioner,
    ledger: IdempotencyLedger,
    locks: LockManager,
    validator: Arc<dyn SourceValidator>,
    extractor: Arc<dyn Extractor>,
    retry: RetryExecutor,
    telemetry: TelemetryLog,
    failures: FailureLedger,
    shard: ShardWriter,
    schema: ShardSchema,
    timeouts: TimeoutConfig,
    pacing: PacingConfig,
    heartbeat_every: Duration,
    /// Daily remote-request budget for this worker; 0 disables the check
    quota: u64,
}

impl ExtractionWorker {
    /// Create a worker, preparing its output directories
    pub fn new(
        config: &FleetConfig,
        partitioner: WorkPartitioner,
        extractor: Arc<dyn Extractor>,
        quota: u64,
    ) -> Result<Self, SetupError> {
        let paths = &config.paths;
        for dir in [&paths.output_root, &paths.shard_dir] {
            std::fs::create_dir_all(dir).map_err(|source| SetupError::Directory {
                path: dir.clone(),
                source,
            })?;
        }

        let schema = config.schema.build()?;
        let worker_index = partitioner.worker_index();

        info!(
            "Worker {}/{} configured: model {} via {}, quota {}, {} max attempts",
            worker_index,
            partitioner.total_workers(),
            extractor.model(),
            extractor.name(),
            quota,
            config.retry.max_attempts
        );

        Ok(Self {
            partitioner,
            ledger: IdempotencyLedger::new(&paths.output_root),
            locks: LockManager::new(worker_index, Duration::from_secs(config.locks.stale_after_secs)),
            validator: Arc::new(FileSignatureValidator::from_config(&config.validation)),
            extractor,
            retry: RetryExecutor::new(config.backoff_policy()),
            telemetry: TelemetryLog::new(&paths.telemetry_log),
            failures: FailureLedger::new(&paths.failure_ledger),
            shard: ShardWriter::for_worker(&paths.shard_dir, worker_index, schema.clone()),
            schema,
            timeouts: config.timeouts.clone(),
            pacing: config.pacing.clone(),
            heartbeat_every: Duration::from_secs(config.locks.heartbeat_secs),
            quota,
        })
    }

    /// Replace the source validator
    pub fn with_validator(mut self, validator: Arc<dyn SourceValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the retry executor
    pub fn with_retry_executor(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_index(&self) -> usize {
        self.partitioner.worker_index()
    }

    /// Process this worker's partition of `items`
    pub async fn run(&self, items: &[WorkItem]) -> RunTally {
        let assigned = self.partitioner.partition(items);
        let worker_index = self.worker_index();
        let mut tally = RunTally::new(worker_index, assigned.len());

        info!(
            "Worker {} starting run {}: {} of {} items assigned",
            worker_index,
            tally.run_id,
            assigned.len(),
            items.len()
        );

        for (position, item) in assigned.iter().enumerate() {
            if self.quota_reached() {
                tally.stop_reason = StopReason::QuotaReached;
                break;
            }
            let limit = self.pacing.max_items_per_run;
            if limit > 0 && tally.sent() >= limit {
                info!("Worker {} reached the per-run limit of {} items", worker_index, limit);
                tally.stop_reason = StopReason::RunLimit;
                break;
            }

            let outcome = self.process_item(item).await;
            let quota_stopped = matches!(outcome, ItemOutcome::QuotaStopped { .. });
            info!(
                "[{}] {} ({}/{}, {:.1}%)",
                item,
                outcome.label(),
                position + 1,
                assigned.len(),
                (position + 1) as f64 / assigned.len() as f64 * 100.0
            );
            tally.record(item, &outcome);
            if quota_stopped {
                break;
            }
        }

        info!("{}", tally);
        tally
    }

    /// Requests left in today's budget for this worker index, `None` when unlimited
    fn remaining_quota(&self) -> Option<u64> {
        if self.quota == 0 {
            return None;
        }
        match self.telemetry.attempts_on(self.worker_index(), Utc::now().date_naive()) {
            Ok(used) => Some(self.quota.saturating_sub(used)),
            Err(e) => {
                warn!("Could not read telemetry for quota check: {}", e);
                None
            }
        }
    }

    fn quota_reached(&self) -> bool {
        if self.remaining_quota() == Some(0) {
            info!(
                "Worker {} has used its quota of {} requests today",
                self.worker_index(),
                self.quota
            );
            return true;
        }
        false
    }

    /// Run one item end to end. The item's lock is released before returning.
    pub async fn process_item(&self, item: &WorkItem) -> ItemOutcome {
        let key = item.key();
        if self.ledger.is_done(&key) {
            debug!("[{}] output exists, skipping", item);
            return ItemOutcome::AlreadyDone;
        }

        let output_path = self.ledger.output_path(&key);
        let token = match self.locks.try_acquire(&output_path) {
            Ok(AcquireResult::Acquired(token)) => token,
            Ok(AcquireResult::Busy(lease)) => {
                match lease {
                    Some(lease) => info!(
                        "[{}] locked by worker {} (pid {}), skipping",
                        item, lease.worker_index, lease.pid
                    ),
                    None => info!("[{}] locked by another worker, skipping", item),
                }
                pause(self.pacing.after_busy_secs).await;
                return ItemOutcome::Busy;
            }
            Err(e) => {
                error!("[{}] lock failed: {}", item, e);
                return ItemOutcome::IoFailed {
                    message: e.to_string(),
                };
            }
        };

        // Another worker may have finished between the ledger check and the acquire
        let outcome = if self.ledger.is_done(&key) {
            ItemOutcome::AlreadyDone
        } else {
            self.process_locked(item, &token).await
        };

        if let Err(e) = token.release() {
            warn!("[{}] failed to release lock: {}", item, e);
        }

        if matches!(outcome, ItemOutcome::Completed { .. }) {
            pause(self.pacing.after_success_secs).await;
        }
        outcome
    }

    async fn process_locked(&self, item: &WorkItem, token: &LockToken) -> ItemOutcome {
        let validated = match self.validator.validate(&item.source_ref) {
            Ok(validated) => validated,
            Err(e) => return self.record_validation_failure(item, e.to_string()).await,
        };

        let profile = SourceProfile::for_size(validated.size_bytes, &self.timeouts);
        info!(
            "[{}] {} tier, ~{} pages, {}s timeout",
            item, profile.tier, profile.estimated_pages, profile.timeout_secs
        );
        for advisory in profile.advisories() {
            match advisory.level {
                AdvisoryLevel::Info => info!("[{}] {}", item, advisory.message),
                AdvisoryLevel::Warning => warn!("[{}] {}", item, advisory.message),
            }
        }

        let content = match SourceContent::read(&item.source_ref).await {
            Ok(content) => content,
            Err(e) => {
                error!("[{}] failed to read source: {}", item, e);
                return ItemOutcome::IoFailed {
                    message: format!("failed to read source: {}", e),
                };
            }
        };

        // Attempts for this item may not overrun today's budget
        let retry = match self.remaining_quota() {
            Some(0) => return ItemOutcome::QuotaStopped { attempts: 0 },
            Some(remaining) => self
                .retry
                .clone()
                .with_attempt_limit(u32::try_from(remaining).unwrap_or(u32::MAX)),
            None => self.retry.clone(),
        };
        let capped = retry.policy().max_attempts() < self.retry.policy().max_attempts();

        let label = item.to_string();
        let timeout = profile.timeout();
        let extractor = &self.extractor;
        let content = &content;
        let started = Instant::now();

        let report = self
            .with_heartbeat(
                item,
                token,
                retry.run(&label, timeout, move |_attempt| async move {
                    let extraction = extractor.extract(content, timeout).await?;
                    if !extraction.payload.is_object() {
                        return Err(RemoteError::new("extraction payload is not a JSON object"));
                    }
                    Ok::<_, RemoteError>(extraction)
                }),
            )
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match report.result {
            Ok(extraction) => {
                self.record_success(
                    item,
                    validated.size_bytes,
                    extraction,
                    report.attempts,
                    duration_ms,
                )
                .await
            }
            Err(failure) if capped => {
                self.record_quota_stop(
                    item,
                    validated.size_bytes,
                    failure.error_class,
                    failure.error,
                    report.attempts,
                    duration_ms,
                )
                .await
            }
            Err(failure) => {
                self.record_exhausted(
                    item,
                    validated.size_bytes,
                    failure.error_class,
                    failure.error,
                    report.attempts,
                    duration_ms,
                )
                .await
            }
        }
    }

    /// Drive `fut` while refreshing the lock lease on an interval
    async fn with_heartbeat<F: Future>(&self, item: &WorkItem, token: &LockToken, fut: F) -> F::Output {
        tokio::pin!(fut);
        let period = self.heartbeat_every;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                output = &mut fut => return output,
                _ = ticker.tick() => {
                    if let Err(e) = token.heartbeat() {
                        warn!("[{}] lock heartbeat failed: {}", item, e);
                    }
                }
            }
        }
    }

    async fn record_success(
        &self,
        item: &WorkItem,
        size_bytes: u64,
        extraction: Extraction,
        attempts: u32,
        duration_ms: u64,
    ) -> ItemOutcome {
        let key = item.key();
        let projection = match self.schema.project(&extraction.payload) {
            Ok(projection) => projection,
            Err(e) => {
                return ItemOutcome::IoFailed {
                    message: e.to_string(),
                }
            }
        };
        if !projection.dropped.is_empty() {
            warn!(
                "[{}] dropping undeclared payload fields: {}",
                item,
                projection.dropped.join(", ")
            );
        }

        let row = ShardRow {
            group_key: key.group_key.clone(),
            item_id: key.item_id.clone(),
            worker_index: self.worker_index(),
            extracted_at: Utc::now().to_rfc3339(),
            fields: projection.fields,
        };

        // Shard row precedes the done marker
        let written = self
            .shard
            .append(&row)
            .and_then(|()| self.ledger.write_output(&key, &extraction.payload));
        if let Err(e) = written {
            error!("[{}] failed to store result: {}", item, e);
            return ItemOutcome::IoFailed {
                message: e.to_string(),
            };
        }

        let record = TelemetryRecord::success(&key, self.worker_index(), size_bytes)
            .with_duration_ms(duration_ms)
            .with_attempts(attempts)
            .with_tokens(extraction.usage.input_tokens, extraction.usage.output_tokens);
        if let Err(e) = self.telemetry.append_async(record).await {
            warn!("[{}] failed to log telemetry: {}", item, e);
        }

        info!(
            "[{}] extracted in {:.1}s after {} attempt(s), {} tokens",
            item,
            duration_ms as f64 / 1000.0,
            attempts,
            extraction.usage.total()
        );
        ItemOutcome::Completed {
            attempts,
            duration_ms,
        }
    }

    async fn record_exhausted(
        &self,
        item: &WorkItem,
        size_bytes: u64,
        error_class: ErrorClass,
        err: RemoteError,
        attempts: u32,
        duration_ms: u64,
    ) -> ItemOutcome {
        let key = item.key();
        let message = err.to_string();

        let entry = FailureEntry::retries_exhausted(&key, self.worker_index(), error_class, attempts, &message);
        if let Err(e) = self.failures.append_async(entry).await {
            warn!("[{}] failed to write failure ledger: {}", item, e);
        }

        let record = TelemetryRecord::failure(&key, self.worker_index(), size_bytes, error_class.as_str(), &message)
            .with_duration_ms(duration_ms)
            .with_attempts(attempts);
        if let Err(e) = self.telemetry.append_async(record).await {
            warn!("[{}] failed to log telemetry: {}", item, e);
        }

        ItemOutcome::RetriesExhausted {
            attempts,
            error_class,
            message,
        }
    }

    /// Log the requests spent on an item cut short by the quota. The item is
    /// not a permanent failure and stays out of the failure ledger.
    async fn record_quota_stop(
        &self,
        item: &WorkItem,
        size_bytes: u64,
        error_class: ErrorClass,
        err: RemoteError,
        attempts: u32,
        duration_ms: u64,
    ) -> ItemOutcome {
        warn!(
            "[{}] daily quota of {} requests used up after {} attempt(s), last error: {}",
            item, self.quota, attempts, err
        );

        let message = format!("quota reached: {}", err);
        let record = TelemetryRecord::failure(
            &item.key(),
            self.worker_index(),
            size_bytes,
            error_class.as_str(),
            &message,
        )
        .with_duration_ms(duration_ms)
            .with_attempts(attempts);
        if let Err(e) = self.telemetry.append_async(record).await {
            warn!("[{}] failed to log telemetry: {}", item, e);
        }

        ItemOutcome::QuotaStopped { attempts }
    }

    async fn record_validation_failure(&self, item: &WorkItem, message: String) -> ItemOutcome {
        warn!("[{}] rejected: {}", item, message);
        let key = item.key();

        let entry = FailureEntry::validation(&key, self.worker_index(), &message);
        if let Err(e) = self.failures.append_async(entry).await {
            warn!("[{}] failed to write failure ledger: {}", item, e);
        }

        let record = TelemetryRecord::failure(
            &key,
            self.worker_index(),
            item.size_bytes,
            VALIDATION_CLASS,
            &message,
        );
        if let Err(e) = self.telemetry.append_async(record).await {
            warn!("[{}] failed to log telemetry: {}", item, e);
        }

        ItemOutcome::ValidationFailed { message }
    }
}

async fn pause(secs: u64) {
    if secs > 0 {
        debug!("Waiting {}s before the next item", secs);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}
