//! Per-item outcome of a worker pass

use serde::{Deserialize, Serialize};

use crate::retry::ErrorClass;

/// Result of processing one work item.
///
/// None of these abort the run; fatal conditions are reported through
/// [`SetupError`](crate::error::SetupError) before any item is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ItemOutcome {
    /// Terminal artifact written
    Completed {
        /// Remote attempts made, including the successful one
        attempts: u32,
        /// Wall-clock time spent on the item
        duration_ms: u64,
    },
    /// Terminal artifact already existed; nothing was attempted
    AlreadyDone,
    /// Another worker holds the item's lock
    Busy,
    /// Source failed structural checks; no remote attempt was made
    ValidationFailed { message: String },
    /// Every remote attempt failed
    RetriesExhausted {
        attempts: u32,
        error_class: ErrorClass,
        message: String,
    },
    /// Local filesystem failure (lock, read, write); item skipped without retry
    IoFailed { message: String },
    /// The worker's daily request budget ran out before the item finished
    QuotaStopped { attempts: u32 },
}

impl ItemOutcome {
    /// Whether the item ended in a recorded failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::ValidationFailed { .. }
                | ItemOutcome::RetriesExhausted { .. }
                | ItemOutcome::IoFailed { .. }
        )
    }

    /// Remote attempts consumed by this item
    pub fn attempts(&self) -> u32 {
        match self {
            ItemOutcome::Completed { attempts, .. } => *attempts,
            ItemOutcome::RetriesExhausted { attempts, .. } => *attempts,
            ItemOutcome::QuotaStopped { attempts } => *attempts,
            _ => 0,
        }
    }

    /// Short label for status lines
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Completed { .. } => "completed",
            ItemOutcome::AlreadyDone => "already done",
            ItemOutcome::Busy => "busy",
            ItemOutcome::ValidationFailed { .. } => "validation failed",
            ItemOutcome::RetriesExhausted { .. } => "retries exhausted",
            ItemOutcome::IoFailed { .. } => "io failed",
            ItemOutcome::QuotaStopped { .. } => "quota reached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_and_attempts() {
        let done = ItemOutcome::Completed { attempts: 3, duration_ms: 10 };
        assert!(!done.is_failure());
        assert_eq!(done.attempts(), 3);

        let invalid = ItemOutcome::ValidationFailed { message: "empty".to_string() };
        assert!(invalid.is_failure());
        assert_eq!(invalid.attempts(), 0);

        assert!(!ItemOutcome::Busy.is_failure());
        let stopped = ItemOutcome::QuotaStopped { attempts: 2 };
        assert!(!stopped.is_failure());
        assert_eq!(stopped.attempts(), 2);
        assert_eq!(ItemOutcome::AlreadyDone.label(), "already done");
    }

    #[test]
    fn test_serializes_with_tag() {
        let outcome = ItemOutcome::RetriesExhausted {
            attempts: 5,
            error_class: ErrorClass::RateLimited,
            message: "429".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "retries_exhausted");
        assert_eq!(json["error_class"], "rate_limited");
    }
}
