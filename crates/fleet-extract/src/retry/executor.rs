//! Retry loop around a remote call

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::backoff::{classify_remote_error, BackoffPolicy, ErrorClass, RetrySchedule};
use crate::providers::RemoteError;

/// Maps a remote error to its class
pub type Classifier = fn(&RemoteError) -> ErrorClass;

/// Terminal failure after every attempt was used
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error_class: ErrorClass,
    pub error: RemoteError,
}

/// Result of [`RetryExecutor::run`] with the attempt history
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: std::result::Result<T, RetryFailure>,
    /// Attempts actually made, successful one included
    pub attempts: u32,
    /// One entry per failed attempt
    pub schedule: Vec<RetrySchedule>,
    pub elapsed: Duration,
}

impl<T> RetryReport<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs a remote call up to `max_attempts` times, sleeping per class between attempts.
///
/// No sleep follows the final attempt. Each attempt is bounded by the caller's
/// timeout; expiry counts as [`ErrorClass::Timeout`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    classify: Classifier,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            classify: classify_remote_error,
        }
    }

    /// Replace the default classifier
    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    /// Make at most `limit` attempts, below the policy's own ceiling
    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.policy = self.policy.with_attempt_limit(limit);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds or attempts run out.
    ///
    /// `call` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        attempt_timeout: Duration,
        mut call: F,
    ) -> RetryReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts();
        let mut schedule = Vec::new();
        let mut attempt = 0u32;

        loop {
            debug!("[{}] attempt {}/{}", label, attempt + 1, max_attempts);

            let outcome = match tokio::time::timeout(attempt_timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::timed_out(attempt_timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    return RetryReport {
                        result: Ok(value),
                        attempts: attempt + 1,
                        schedule,
                        elapsed: start.elapsed(),
                    };
                }
                Err(err) => err,
            };

            let class = (self.classify)(&err);
            let step = self.policy.schedule(class, attempt);
            schedule.push(step);

            match step.next_delay {
                Some(delay) => {
                    warn!(
                        "[{}] attempt {}/{} failed ({}): {}; retrying in {:?}",
                        label,
                        attempt + 1,
                        max_attempts,
                        class,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    error!(
                        "[{}] giving up after {} attempts ({}): {}",
                        label,
                        attempt + 1,
                        class,
                        err
                    );
                    return RetryReport {
                        result: Err(RetryFailure {
                            error_class: class,
                            error: err,
                        }),
                        attempts: attempt + 1,
                        schedule,
                        elapsed: start.elapsed(),
                    };
                }
            }
        }
    }
}
