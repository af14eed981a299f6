//! Error types for the extraction fleet

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by library operations (locks, ledger, telemetry, shards, merge)
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source failed structural validation
    #[error("Validation failed for '{source_ref}': {message}")]
    Validation { source_ref: String, message: String },

    /// Lock artifact could not be created, inspected or removed
    #[error("Lock error on {}: {message}", path.display())]
    Lock { path: PathBuf, message: String },

    /// Shard or store did not match the declared schema
    #[error("Schema error: {0}")]
    Schema(String),

    /// Merge could not replace the consolidated store
    #[error("Merge failed after {attempts} attempts: {message}")]
    MergeExhausted { attempts: u32, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            source_ref: source_ref.into(),
            message: message.into(),
        }
    }

    /// Create a lock error
    pub fn lock(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Fatal errors that prevent a worker from processing any item.
///
/// These are the only failures that change the process exit code.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Worker index outside `0..total_workers` or zero workers
    #[error("Invalid worker assignment: index {index} of {total} workers")]
    InvalidAssignment { index: usize, total: usize },

    /// No usable API key in the environment
    #[error("Missing credentials: neither {requested} nor {fallback} is set")]
    MissingCredentials { requested: String, fallback: String },

    /// Configuration could not be read or is inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A required directory could not be created or read
    #[error("Unusable directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Work inventory could not be enumerated
    #[error("Failed to enumerate work items: {0}")]
    Inventory(String),
}

impl From<Error> for SetupError {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(msg) => SetupError::Config(msg),
            other => SetupError::Inventory(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("1/a.pdf", "source is empty");
        assert_eq!(err.to_string(), "Validation failed for '1/a.pdf': source is empty");
        assert!(Error::lock("/tmp/x.lock", "busy").to_string().contains("/tmp/x.lock"));
    }

    #[test]
    fn test_setup_error_from_config() {
        let err: SetupError = Error::Config("bad quota".to_string()).into();
        assert!(matches!(err, SetupError::Config(msg) if msg == "bad quota"));
    }
}
