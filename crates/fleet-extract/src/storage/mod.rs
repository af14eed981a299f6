//! Filesystem-backed coordination state
//!
//! Per-item locks, the completion ledger, worker shards and the merged store.

mod fsutil;
mod ledger;
mod lock;
mod merge;
mod shard;

pub use fsutil::{atomic_write, atomic_write_json, ensure_parent};
pub use ledger::IdempotencyLedger;
pub use lock::{AcquireResult, LockLease, LockManager, LockToken};
pub use merge::{MergeReport, ShardMerger};
pub use shard::{
    encode_rows, read_rows, Projection, ShardRow, ShardSchema, ShardWriter, METADATA_COLUMNS,
};
