//! Error classes and their backoff schedules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::providers::RemoteError;

/// Failure mode of a remote extraction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Deadline exceeded, 504, or the coordinator's own attempt timeout
    Timeout,
    /// 503 or dropped connection
    ServiceUnavailable,
    /// Quota or 429
    RateLimited,
    /// Anything else
    Other,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 4] = [
        ErrorClass::Timeout,
        ErrorClass::ServiceUnavailable,
        ErrorClass::RateLimited,
        ErrorClass::Other,
    ];

    /// Stable name used in telemetry and the failure ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ServiceUnavailable => "service_unavailable",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Other => "other",
        }
    }

    fn index(&self) -> usize {
        match self {
            ErrorClass::Timeout => 0,
            ErrorClass::ServiceUnavailable => 1,
            ErrorClass::RateLimited => 2,
            ErrorClass::Other => 3,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default classifier: explicit class first, then HTTP status, then message keywords.
pub fn classify_remote_error(err: &RemoteError) -> ErrorClass {
    if let Some(class) = err.class_hint {
        return class;
    }

    match err.status {
        Some(504) | Some(408) => return ErrorClass::Timeout,
        Some(503) => return ErrorClass::ServiceUnavailable,
        Some(429) => return ErrorClass::RateLimited,
        _ => {}
    }

    let message = err.message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if contains_any(&["deadlineexceeded", "deadline exceeded", "504", "timeout", "timed out"]) {
        ErrorClass::Timeout
    } else if contains_any(&[
        "serviceunavailable",
        "service unavailable",
        "503",
        "connection reset",
    ]) {
        ErrorClass::ServiceUnavailable
    } else if contains_any(&[
        "quota",
        "429",
        "rate limit",
        "too many requests",
        "resource_exhausted",
        "resourceexhausted",
    ]) {
        ErrorClass::RateLimited
    } else {
        ErrorClass::Other
    }
}

/// Where a failed attempt leaves the retry loop. Recomputed per call, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Zero-based attempt that just failed
    pub attempt: u32,
    /// Class of its error
    pub error_class: ErrorClass,
    /// Delay before the next attempt, `None` once attempts are exhausted
    pub next_delay: Option<Duration>,
}

/// Largest supported attempt count; keeps `2^attempt` within `u32`
pub const MAX_ATTEMPTS: u32 = 32;

/// Per-class exponential backoff: `base * 2^attempt`, bounded by `max_attempts`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_attempts: u32,
    bases: [Duration; 4],
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(5)
            .with_base(ErrorClass::Timeout, Duration::from_secs(120))
            .with_base(ErrorClass::ServiceUnavailable, Duration::from_secs(60))
            .with_base(ErrorClass::RateLimited, Duration::from_secs(60))
            .with_base(ErrorClass::Other, Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    /// Policy with `max_attempts` (clamped to `1..=MAX_ATTEMPTS`) and
    /// one-second bases for every class
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS),
            bases: [Duration::from_secs(1); 4],
        }
    }

    /// Set the base delay for one class
    pub fn with_base(mut self, class: ErrorClass, base: Duration) -> Self {
        self.bases[class.index()] = base;
        self
    }

    /// Same base delay for every class
    pub fn uniform(max_attempts: u32, base: Duration) -> Self {
        let mut policy = Self::new(max_attempts);
        policy.bases = [base; 4];
        policy
    }

    /// Lower the attempt ceiling to `limit`, never raising it
    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.max_attempts = self.max_attempts.min(limit.max(1));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base(&self, class: ErrorClass) -> Duration {
        self.bases[class.index()]
    }

    /// Delay after zero-based attempt `attempt` failed with `class`
    pub fn delay(&self, class: ErrorClass, attempt: u32) -> Duration {
        match 2u32.checked_pow(attempt) {
            Some(factor) => self.base(class).saturating_mul(factor),
            None => Duration::MAX,
        }
    }

    /// Schedule after zero-based attempt `attempt` failed with `class`
    pub fn schedule(&self, class: ErrorClass, attempt: u32) -> RetrySchedule {
        let next_delay = if attempt + 1 < self.max_attempts {
            Some(self.delay(class, attempt))
        } else {
            None
        };
        RetrySchedule {
            attempt,
            error_class: class,
            next_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(
            classify_remote_error(&RemoteError::with_status(504, "gateway")),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_remote_error(&RemoteError::with_status(503, "down")),
            ErrorClass::ServiceUnavailable
        );
        assert_eq!(
            classify_remote_error(&RemoteError::with_status(429, "slow down")),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_remote_error(&RemoteError::with_status(400, "bad request")),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_classify_by_message() {
        let cases = [
            ("DeadlineExceeded: 504 Deadline Exceeded", ErrorClass::Timeout),
            ("ServiceUnavailable: model overloaded", ErrorClass::ServiceUnavailable),
            ("Connection reset by peer", ErrorClass::ServiceUnavailable),
            ("Quota exceeded for metric", ErrorClass::RateLimited),
            ("RESOURCE_EXHAUSTED", ErrorClass::RateLimited),
            ("No content returned by model", ErrorClass::Other),
        ];
        for (message, expected) in cases {
            assert_eq!(
                classify_remote_error(&RemoteError::new(message)),
                expected,
                "{}",
                message
            );
        }
    }

    #[test]
    fn test_hint_wins() {
        let err = RemoteError::new("quota exceeded").with_class(ErrorClass::Timeout);
        assert_eq!(classify_remote_error(&err), ErrorClass::Timeout);
    }

    #[test]
    fn test_default_schedule_matches_observed_delays() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(ErrorClass::Timeout, 0), Duration::from_secs(120));
        assert_eq!(policy.delay(ErrorClass::Timeout, 3), Duration::from_secs(960));
        assert_eq!(policy.delay(ErrorClass::RateLimited, 2), Duration::from_secs(240));
        assert_eq!(policy.delay(ErrorClass::Other, 1), Duration::from_secs(60));
        assert!(policy.base(ErrorClass::RateLimited) > policy.base(ErrorClass::Other));
        assert!(policy.base(ErrorClass::ServiceUnavailable) > policy.base(ErrorClass::Other));
    }

    #[test]
    fn test_schedule_stops_at_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.schedule(ErrorClass::Other, 3).next_delay.is_some());
        let last = policy.schedule(ErrorClass::Other, 4);
        assert_eq!(last.next_delay, None);
        assert_eq!(last.attempt, 4);
    }

    #[test]
    fn test_attempts_are_bounded() {
        assert_eq!(BackoffPolicy::new(100).max_attempts(), MAX_ATTEMPTS);
        assert_eq!(BackoffPolicy::new(0).max_attempts(), 1);

        let policy = BackoffPolicy::new(MAX_ATTEMPTS);
        let last = MAX_ATTEMPTS - 2;
        assert!(policy.delay(ErrorClass::Other, last) > policy.delay(ErrorClass::Other, last - 1));

        assert_eq!(BackoffPolicy::new(5).with_attempt_limit(2).max_attempts(), 2);
        assert_eq!(BackoffPolicy::new(5).with_attempt_limit(9).max_attempts(), 5);
    }

    proptest! {
        #[test]
        fn prop_delay_strictly_increases(
            base_ms in 1u64..600_000,
            max_attempts in 1u32..=MAX_ATTEMPTS,
            class_idx in 0usize..4,
        ) {
            let class = ErrorClass::ALL[class_idx];
            let policy = BackoffPolicy::new(max_attempts)
                .with_base(class, Duration::from_millis(base_ms));
            for k in 0..max_attempts.saturating_sub(1) {
                prop_assert!(policy.delay(class, k) < policy.delay(class, k + 1));
            }
        }
    }
}
