//! Remote error classification and bounded exponential-backoff retries

mod backoff;
mod executor;

pub use backoff::{classify_remote_error, BackoffPolicy, ErrorClass, RetrySchedule, MAX_ATTEMPTS};
pub use executor::{Classifier, RetryExecutor, RetryFailure, RetryReport};
