//! Append-only telemetry, failure ledger and summaries

mod failures;
mod log;
mod record;
mod summary;

pub use failures::FailureLedger;
pub use log::{latest_per_key, DedupeReport, TelemetryLog, DEFAULT_LOCK_TIMEOUT};
pub use record::{FailureEntry, FailureKind, TelemetryRecord, VALIDATION_CLASS};
pub use summary::{ItemExtreme, ProgressEstimate, Summary};
