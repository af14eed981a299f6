//! Telemetry and failure-ledger line formats

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::ErrorClass;
use crate::types::ItemKey;

/// Error class recorded for sources rejected before any remote call
pub const VALIDATION_CLASS: &str = "validation";

/// One processed item, as appended to the telemetry log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub group_key: String,
    /// Item id; named for the source file it came from
    pub filename: String,
    pub worker_index: usize,
    pub size_bytes: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Billed units (total tokens)
    #[serde(default)]
    pub resource_units: u64,
    /// Remote requests spent on the item
    #[serde(default)]
    pub attempts: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TelemetryRecord {
    /// Record for a completed extraction
    pub fn success(key: &ItemKey, worker_index: usize, size_bytes: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            group_key: key.group_key.clone(),
            filename: key.item_id.clone(),
            worker_index,
            size_bytes,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            resource_units: 0,
            attempts: 0,
            success: true,
            error_class: None,
            error_message: None,
        }
    }

    /// Record for a failed item
    pub fn failure(
        key: &ItemKey,
        worker_index: usize,
        size_bytes: u64,
        error_class: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_class: Some(error_class.into()),
            error_message: Some(message.into()),
            ..Self::success(key, worker_index, size_bytes)
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.resource_units = input_tokens + output_tokens;
        self
    }

    /// Dedupe key: `(filename, group_key)`
    pub fn dedupe_key(&self) -> (String, String) {
        (self.filename.clone(), self.group_key.clone())
    }

    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Why an item landed in the failure ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    RetriesExhausted,
}

/// One permanently failed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub group_key: String,
    pub item_id: String,
    pub worker_index: usize,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub attempts: u32,
    pub message: String,
}

impl FailureEntry {
    pub fn validation(key: &ItemKey, worker_index: usize, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            group_key: key.group_key.clone(),
            item_id: key.item_id.clone(),
            worker_index,
            kind: FailureKind::Validation,
            error_class: None,
            attempts: 0,
            message: message.into(),
        }
    }

    pub fn retries_exhausted(
        key: &ItemKey,
        worker_index: usize,
        error_class: ErrorClass,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: FailureKind::RetriesExhausted,
            error_class: Some(error_class),
            attempts,
            ..Self::validation(key, worker_index, message)
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.group_key.clone(), self.item_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builders() {
        let key = ItemKey::new("7", "a.pdf");
        let record = TelemetryRecord::success(&key, 2, 4096)
            .with_attempts(3)
            .with_tokens(100, 20)
            .with_duration_ms(1500);
        assert!(record.success);
        assert_eq!(record.resource_units, 120);
        assert_eq!(record.dedupe_key(), ("a.pdf".to_string(), "7".to_string()));

        let failed = TelemetryRecord::failure(&key, 2, 4096, VALIDATION_CLASS, "too small");
        assert!(!failed.success);
        assert_eq!(failed.attempts, 0);
        assert_eq!(failed.error_class.as_deref(), Some("validation"));
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let line = r#"{"timestamp":"2026-03-01T10:00:00Z","group_key":"1","filename":"a.pdf",
            "worker_index":0,"size_bytes":10,"duration_ms":5,"success":true}"#;
        let record: TelemetryRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.error_class, None);
    }

    #[test]
    fn test_failure_entry_serialization() {
        let entry = FailureEntry::retries_exhausted(
            &ItemKey::new("1", "b.pdf"),
            0,
            ErrorClass::ServiceUnavailable,
            5,
            "503",
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "retries_exhausted");
        assert_eq!(json["error_class"], "service_unavailable");
        assert_eq!(entry.key(), ItemKey::new("1", "b.pdf"));
    }
}
