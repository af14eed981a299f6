//! Core types shared across the fleet

pub mod outcome;
pub mod work_item;

pub use outcome::ItemOutcome;
pub use work_item::{ItemKey, WorkItem};
