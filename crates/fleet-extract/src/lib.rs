//! fleet-extract: filesystem-coordinated document extraction workers
//!
//! Many independent worker processes split a shared inventory by index, send
//! each source to a rate-limited extraction service and write results into
//! per-worker shards. Coordination happens only through the filesystem: per-item
//! lock artifacts, output files acting as the completion ledger, a lock-protected
//! telemetry log, and an atomic shard merge into one consolidated store.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use config::FleetConfig;
pub use error::{Error, Result, SetupError};
pub use processing::{ExtractionWorker, RunTally, WorkPartitioner};
pub use providers::{Extractor, GeminiExtractor, RemoteError};
pub use retry::{BackoffPolicy, ErrorClass, RetryExecutor};
pub use storage::{IdempotencyLedger, LockManager, ShardMerger, ShardSchema};
pub use telemetry::{FailureLedger, Summary, TelemetryLog};
pub use types::{ItemKey, ItemOutcome, WorkItem};
