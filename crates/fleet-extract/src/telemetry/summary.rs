//! Summary statistics over telemetry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::record::TelemetryRecord;
use crate::error::Result;
use crate::storage::atomic_write_json;

/// Snapshot of one notable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemExtreme {
    pub group_key: String,
    pub filename: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub resource_units: u64,
}

impl From<&TelemetryRecord> for ItemExtreme {
    fn from(record: &TelemetryRecord) -> Self {
        Self {
            group_key: record.group_key.clone(),
            filename: record.filename.clone(),
            size_bytes: record.size_bytes,
            duration_ms: record.duration_ms,
            resource_units: record.resource_units,
        }
    }
}

/// Aggregate view of the telemetry log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate_percent: f64,
    pub total_duration_hours: f64,
    pub avg_duration_secs: f64,
    /// Average over successful items only, used for time estimates
    pub avg_success_duration_secs: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_resource_units: u64,
    pub avg_resource_units: f64,
    /// Remote requests across all records
    pub total_requests: u64,
    pub requests_today: u64,
    pub daily_request_limit: u64,
    pub requests_remaining_today: u64,
    pub largest_item: Option<ItemExtreme>,
    pub slowest_item: Option<ItemExtreme>,
    pub most_resource_units: Option<ItemExtreme>,
    /// Failed records per error class
    pub error_breakdown: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEstimate>,
    pub last_updated: DateTime<Utc>,
}

/// Progress toward a target item count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEstimate {
    pub target: usize,
    pub progress_percent: f64,
    pub remaining_items: usize,
    pub estimated_remaining_hours: f64,
    /// Days needed for the remaining items at the daily request ceiling, if there is one
    pub days_needed: Option<f64>,
    pub requests_remaining_today: u64,
}

impl Summary {
    /// Fold `records` into a summary. Reads nothing and writes nothing.
    pub fn compute(records: &[TelemetryRecord], daily_limit: u64, now: DateTime<Utc>) -> Self {
        let total_items = records.len();
        let successful: Vec<&TelemetryRecord> = records.iter().filter(|r| r.success).collect();
        let failed = total_items - successful.len();

        let total_ms: u64 = records.iter().map(|r| r.duration_ms).sum();
        let success_ms: u64 = successful.iter().map(|r| r.duration_ms).sum();
        let total_resource_units: u64 = records.iter().map(|r| r.resource_units).sum();

        let today = now.date_naive();
        let requests_today: u64 = records
            .iter()
            .filter(|r| r.day() == today)
            .map(|r| u64::from(r.attempts))
            .sum();

        let mut error_breakdown = BTreeMap::new();
        for record in records.iter().filter(|r| !r.success) {
            let class = record
                .error_class
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *error_breakdown.entry(class).or_insert(0) += 1;
        }

        Self {
            total_items,
            successful: successful.len(),
            failed,
            success_rate_percent: ratio(successful.len() as f64, total_items) * 100.0,
            total_duration_hours: total_ms as f64 / 3_600_000.0,
            avg_duration_secs: ratio(total_ms as f64 / 1000.0, total_items),
            avg_success_duration_secs: ratio(success_ms as f64 / 1000.0, successful.len()),
            total_input_tokens: records.iter().map(|r| r.input_tokens).sum(),
            total_output_tokens: records.iter().map(|r| r.output_tokens).sum(),
            total_resource_units,
            avg_resource_units: ratio(total_resource_units as f64, total_items),
            total_requests: records.iter().map(|r| u64::from(r.attempts)).sum(),
            requests_today,
            daily_request_limit: daily_limit,
            requests_remaining_today: daily_limit.saturating_sub(requests_today),
            largest_item: records.iter().max_by_key(|r| r.size_bytes).map(Into::into),
            slowest_item: records.iter().max_by_key(|r| r.duration_ms).map(Into::into),
            most_resource_units: records.iter().max_by_key(|r| r.resource_units).map(Into::into),
            error_breakdown,
            progress: None,
            last_updated: now,
        }
    }

    /// Attach a progress estimate toward `target` completed items
    pub fn with_progress(mut self, target: usize) -> Self {
        self.progress = Some(ProgressEstimate::from_summary(&self, target));
        self
    }

    /// Write as pretty JSON, replacing any previous summary atomically
    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

impl ProgressEstimate {
    pub fn from_summary(summary: &Summary, target: usize) -> Self {
        let remaining_items = target.saturating_sub(summary.successful);
        let progress_percent = if target == 0 {
            100.0
        } else {
            (summary.successful.min(target) as f64 / target as f64) * 100.0
        };
        let days_needed = (summary.daily_request_limit > 0)
            .then(|| remaining_items as f64 / summary.daily_request_limit as f64);

        Self {
            target,
            progress_percent,
            remaining_items,
            estimated_remaining_hours: remaining_items as f64 * summary.avg_success_duration_secs
                / 3600.0,
            days_needed,
            requests_remaining_today: summary.requests_remaining_today,
        }
    }
}

fn ratio(numerator: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        numerator / count as f64
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Extraction summary")?;
        writeln!(
            f,
            "  Items: {}/{} succeeded ({:.1}%)",
            self.successful, self.total_items, self.success_rate_percent
        )?;
        writeln!(
            f,
            "  Requests today: {}/{} ({} remaining)",
            self.requests_today, self.daily_request_limit, self.requests_remaining_today
        )?;
        writeln!(f, "  Total time: {:.1} hours", self.total_duration_hours)?;
        writeln!(
            f,
            "  Tokens: {} in, {} out ({:.0} avg per item)",
            self.total_input_tokens, self.total_output_tokens, self.avg_resource_units
        )?;
        writeln!(f, "  Avg time per item: {:.1}s", self.avg_duration_secs)?;
        if let Some(slowest) = &self.slowest_item {
            writeln!(
                f,
                "  Slowest: {}/{} ({:.1}s)",
                slowest.group_key,
                slowest.filename,
                slowest.duration_ms as f64 / 1000.0
            )?;
        }
        if !self.error_breakdown.is_empty() {
            writeln!(f, "  Failures by class:")?;
            for (class, count) in &self.error_breakdown {
                writeln!(f, "    {}: {}", class, count)?;
            }
        }
        if let Some(progress) = &self.progress {
            writeln!(
                f,
                "  Progress: {:.1}% of {} ({} remaining, ~{:.1}h)",
                progress.progress_percent,
                progress.target,
                progress.remaining_items,
                progress.estimated_remaining_hours
            )?;
            if let Some(days) = progress.days_needed {
                writeln!(f, "  Days needed at the daily limit: {:.1}", days)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemKey;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(file: &str, success: bool, ms: u64, size: u64, attempts: u32) -> TelemetryRecord {
        let key = ItemKey::new("1", file);
        let mut record = if success {
            TelemetryRecord::success(&key, 0, size)
        } else {
            TelemetryRecord::failure(&key, 0, size, "timeout", "deadline")
        };
        record.timestamp = now();
        record
            .with_duration_ms(ms)
            .with_attempts(attempts)
            .with_tokens(size / 10, 10)
    }

    #[test]
    fn test_empty_log() {
        let summary = Summary::compute(&[], 100, now());
        assert_eq!(summary.total_items, 0);
        assert_eq!(summary.success_rate_percent, 0.0);
        assert_eq!(summary.requests_remaining_today, 100);
        assert!(summary.largest_item.is_none());
    }

    #[test]
    fn test_totals_and_extremes() {
        let records = vec![
            record("a.pdf", true, 2000, 1000, 1),
            record("b.pdf", true, 4000, 5000, 3),
            record("c.pdf", false, 9000, 2000, 5),
        ];
        let summary = Summary::compute(&records, 100, now());

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_requests, 9);
        assert_eq!(summary.requests_today, 9);
        assert_eq!(summary.requests_remaining_today, 91);
        assert_eq!(summary.avg_duration_secs, 5.0);
        assert_eq!(summary.avg_success_duration_secs, 3.0);
        assert_eq!(summary.largest_item.as_ref().unwrap().filename, "b.pdf");
        assert_eq!(summary.slowest_item.as_ref().unwrap().filename, "c.pdf");
        assert_eq!(summary.error_breakdown.get("timeout"), Some(&1));
    }

    #[test]
    fn test_quota_never_negative() {
        let records = vec![record("a.pdf", true, 10, 10, 150)];
        let summary = Summary::compute(&records, 100, now());
        assert_eq!(summary.requests_remaining_today, 0);
    }

    #[test]
    fn test_progress_estimate() {
        let records = vec![
            record("a.pdf", true, 3_600_000, 10, 1),
            record("b.pdf", false, 10, 10, 5),
        ];
        let summary = Summary::compute(&records, 100, now()).with_progress(201);
        let progress = summary.progress.clone().unwrap();

        assert_eq!(progress.remaining_items, 200);
        assert_eq!(progress.estimated_remaining_hours, 200.0);
        assert_eq!(progress.days_needed, Some(2.0));
        assert!(summary.to_string().contains("Progress"));
    }

    #[test]
    fn test_write_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = Summary::compute(&[record("a.pdf", true, 10, 10, 1)], 100, now());
        summary.write(&path).unwrap();

        let back: Summary = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back.total_items, 1);
        assert_eq!(back.total_requests, summary.total_requests);
        assert_eq!(back.last_updated, summary.last_updated);
    }
}
