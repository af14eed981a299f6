//! Per-worker processing: partitioning, size tiers and the extraction loop

mod file_tier;
mod partition;
mod tally;
mod worker;

pub use file_tier::{AdvisoryLevel, SizeAdvisory, SizeTier, SourceProfile};
pub use partition::WorkPartitioner;
pub use tally::{ItemError, RunTally, StopReason};
pub use worker::ExtractionWorker;
