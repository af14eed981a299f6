//! Per-run progress tally for one worker

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::ErrorClass;
use crate::types::{ItemOutcome, WorkItem};

/// Error details for an item that failed in this run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub group_key: String,
    pub item_id: String,
    pub outcome: String,
    pub error: String,
}

/// Why a run stopped before exhausting its slice
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every assigned item was visited
    Exhausted,
    /// Per-run item ceiling reached
    RunLimit,
    /// Worker's daily request budget used up
    QuotaReached,
}

/// Progress information for one worker run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTally {
    pub run_id: Uuid,
    pub worker_index: usize,
    pub total_items: usize,
    pub completed: usize,
    pub already_done: usize,
    pub busy: usize,
    pub validation_failed: usize,
    pub retries_exhausted: usize,
    /// Subset of `retries_exhausted` whose last attempt timed out
    pub timeouts: usize,
    pub io_failed: usize,
    /// Remote attempts made this run
    pub attempts: u32,
    pub stop_reason: StopReason,
    pub item_errors: Vec<ItemError>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RunTally {
    pub fn new(worker_index: usize, total_items: usize) -> Self {
        let now = chrono::Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            worker_index,
            total_items,
            completed: 0,
            already_done: 0,
            busy: 0,
            validation_failed: 0,
            retries_exhausted: 0,
            timeouts: 0,
            io_failed: 0,
            attempts: 0,
            stop_reason: StopReason::Exhausted,
            item_errors: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Fold one item's outcome into the tally
    pub fn record(&mut self, item: &WorkItem, outcome: &ItemOutcome) {
        self.attempts += outcome.attempts();
        match outcome {
            ItemOutcome::Completed { .. } => self.completed += 1,
            ItemOutcome::AlreadyDone => self.already_done += 1,
            ItemOutcome::Busy => self.busy += 1,
            ItemOutcome::ValidationFailed { message } => {
                self.validation_failed += 1;
                self.push_error(item, outcome, message);
            }
            ItemOutcome::RetriesExhausted {
                message,
                error_class,
                ..
            } => {
                self.retries_exhausted += 1;
                if *error_class == ErrorClass::Timeout {
                    self.timeouts += 1;
                }
                self.push_error(item, outcome, message);
            }
            ItemOutcome::IoFailed { message } => {
                self.io_failed += 1;
                self.push_error(item, outcome, message);
            }
            ItemOutcome::QuotaStopped { .. } => self.stop_reason = StopReason::QuotaReached,
        }
        self.updated_at = chrono::Utc::now();
    }

    fn push_error(&mut self, item: &WorkItem, outcome: &ItemOutcome, message: &str) {
        self.item_errors.push(ItemError {
            group_key: item.group_key.clone(),
            item_id: item.item_id.clone(),
            outcome: outcome.label().to_string(),
            error: message.to_string(),
        });
    }

    /// Items that reached the extraction service this run
    pub fn sent(&self) -> usize {
        self.completed + self.retries_exhausted
    }

    /// Items visited so far
    pub fn visited(&self) -> usize {
        self.completed
            + self.already_done
            + self.busy
            + self.validation_failed
            + self.retries_exhausted
            + self.io_failed
    }

    pub fn failed(&self) -> usize {
        self.validation_failed + self.retries_exhausted + self.io_failed
    }

    /// Percent of the slice visited
    pub fn percent(&self) -> f64 {
        if self.total_items == 0 {
            100.0
        } else {
            self.visited() as f64 / self.total_items as f64 * 100.0
        }
    }
}

impl std::fmt::Display for RunTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Worker {} run {}: {}/{} items visited ({:?})",
            self.worker_index,
            self.run_id,
            self.visited(),
            self.total_items,
            self.stop_reason
        )?;
        writeln!(f, "  Succeeded:          {}", self.completed)?;
        writeln!(f, "  Skipped (done):     {}", self.already_done)?;
        writeln!(f, "  Skipped (busy):     {}", self.busy)?;
        writeln!(f, "  Validation failed:  {}", self.validation_failed)?;
        writeln!(
            f,
            "  Retries exhausted:  {} ({} timeouts)",
            self.retries_exhausted, self.timeouts
        )?;
        writeln!(f, "  I/O failures:       {}", self.io_failed)?;
        write!(f, "  Remote attempts:    {}", self.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let item = WorkItem::new("1", "a.pdf", "/in/1/a.pdf", 4096);
        let mut tally = RunTally::new(0, 4);

        tally.record(&item, &ItemOutcome::Completed { attempts: 2, duration_ms: 10 });
        tally.record(&item, &ItemOutcome::AlreadyDone);
        tally.record(
            &item,
            &ItemOutcome::RetriesExhausted {
                attempts: 5,
                error_class: ErrorClass::Timeout,
                message: "deadline".to_string(),
            },
        );
        tally.record(&item, &ItemOutcome::ValidationFailed { message: "too small".to_string() });

        assert_eq!(tally.completed, 1);
        assert_eq!(tally.already_done, 1);
        assert_eq!(tally.timeouts, 1);
        assert_eq!(tally.sent(), 2);
        assert_eq!(tally.failed(), 2);
        assert_eq!(tally.attempts, 7);
        assert_eq!(tally.item_errors.len(), 2);
        assert_eq!(tally.percent(), 100.0);
    }
}
