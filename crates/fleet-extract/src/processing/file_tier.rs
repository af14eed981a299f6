//! Size tier classification for adaptive attempt timeouts
//!
//! Classifies sources into tiers based on size and estimates the work
//! the extraction service will do for them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::TimeoutConfig;

const MB: f64 = 1024.0 * 1024.0;

/// Approximate bytes per rendered page
const BYTES_PER_PAGE: u64 = 50 * 1024;

/// Input tokens the service charges per page
const TOKENS_PER_PAGE: u64 = 258;

/// Source processing tier based on size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    /// Up to 5MB: 600s timeout
    Normal,
    /// 5-8MB: 900s timeout
    Large,
    /// Above 8MB: 1200s timeout
    VeryLarge,
}

impl std::fmt::Display for SizeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeTier::Normal => write!(f, "normal"),
            SizeTier::Large => write!(f, "large"),
            SizeTier::VeryLarge => write!(f, "very_large"),
        }
    }
}

/// Severity of a size advisory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryLevel {
    Info,
    Warning,
}

/// Non-fatal note about a source's size, logged before extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeAdvisory {
    pub level: AdvisoryLevel,
    pub message: String,
}

impl SizeAdvisory {
    fn info(message: String) -> Self {
        Self {
            level: AdvisoryLevel::Info,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            level: AdvisoryLevel::Warning,
            message,
        }
    }
}

/// Source characteristics used to pick the attempt timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProfile {
    /// Source size in bytes
    pub size_bytes: u64,
    /// Assigned tier
    pub tier: SizeTier,
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,
    /// Estimated page count
    pub estimated_pages: u64,
    /// Estimated input tokens
    pub estimated_tokens: u64,
}

impl SourceProfile {
    /// Profile a source of `size_bytes` against the configured thresholds
    pub fn for_size(size_bytes: u64, timeouts: &TimeoutConfig) -> Self {
        let tier = timeouts.tier_for_size(size_bytes);
        let estimated_pages = size_bytes / BYTES_PER_PAGE;

        Self {
            size_bytes,
            tier,
            timeout_secs: timeouts.timeout_for_tier(tier).as_secs(),
            estimated_pages,
            estimated_tokens: estimated_pages * TOKENS_PER_PAGE,
        }
    }

    /// Get the timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Size and page-count notes worth logging. Never blocks extraction.
    pub fn advisories(&self) -> Vec<SizeAdvisory> {
        let size_mb = self.size_bytes as f64 / MB;
        let mut notes = Vec::new();

        if size_mb > 15.0 {
            notes.push(SizeAdvisory::warning(format!(
                "Very large source ({:.1}MB), approaching the 20MB limit",
                size_mb
            )));
        } else if size_mb > 10.0 {
            notes.push(SizeAdvisory::warning(format!(
                "Large source ({:.1}MB), may cause timeout issues",
                size_mb
            )));
        } else if size_mb > 5.0 {
            notes.push(SizeAdvisory::info(format!(
                "Large source ({:.1}MB), may take longer to process",
                size_mb
            )));
        }

        if size_mb < 0.1 {
            notes.push(SizeAdvisory::warning(format!(
                "Very small source ({:.2}MB), may be low quality or empty",
                size_mb
            )));
        } else if size_mb < 0.5 {
            notes.push(SizeAdvisory::info(format!(
                "Small source ({:.2}MB), check quality",
                size_mb
            )));
        }

        if self.estimated_pages > 800 {
            notes.push(SizeAdvisory::warning(format!(
                "Estimated {} pages ({} tokens), approaching the 1000 page limit",
                self.estimated_pages, self.estimated_tokens
            )));
        } else if self.estimated_pages > 500 {
            notes.push(SizeAdvisory::info(format!(
                "Estimated {} pages ({} tokens), large document",
                self.estimated_pages, self.estimated_tokens
            )));
        }

        notes
    }
}
