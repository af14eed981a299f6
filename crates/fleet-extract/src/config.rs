//! Configuration for the extraction fleet

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result, SetupError};
use crate::processing::SizeTier;
use crate::retry::{BackoffPolicy, ErrorClass, MAX_ATTEMPTS};
use crate::storage::ShardSchema;

/// Main fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Filesystem layout shared by all workers
    pub paths: PathsConfig,
    /// Source validation limits
    pub validation: ValidationConfig,
    /// Retry schedule for remote calls
    pub retry: RetryConfig,
    /// Size-based attempt timeouts
    pub timeouts: TimeoutConfig,
    /// Per-item lock behavior
    pub locks: LockConfig,
    /// Request quota accounting
    pub quota: QuotaConfig,
    /// Delays between items
    pub pacing: PacingConfig,
    /// Shard merge behavior
    pub merge: MergeConfig,
    /// Declared shard row schema
    pub schema: SchemaConfig,
    /// Gemini extraction service
    pub gemini: GeminiConfig,
}

impl FleetConfig {
    /// Load configuration from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                toml::from_str::<FleetConfig>(&raw).map_err(|e| {
                    Error::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
            None => FleetConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_ATTEMPTS {
            return Err(Error::Config(format!(
                "retry.max_attempts ({}) must be between 1 and {}",
                self.retry.max_attempts, MAX_ATTEMPTS
            )));
        }
        if self.validation.min_bytes > self.validation.max_bytes {
            return Err(Error::Config(format!(
                "validation.min_bytes ({}) exceeds validation.max_bytes ({})",
                self.validation.min_bytes, self.validation.max_bytes
            )));
        }
        if self.locks.heartbeat_secs == 0 || self.locks.heartbeat_secs >= self.locks.stale_after_secs {
            return Err(Error::Config(format!(
                "locks.heartbeat_secs ({}) must be non-zero and below locks.stale_after_secs ({})",
                self.locks.heartbeat_secs, self.locks.stale_after_secs
            )));
        }
        if self.merge.max_attempts == 0 {
            return Err(Error::Config("merge.max_attempts must be at least 1".to_string()));
        }
        // Building the schema runs the field-name checks
        self.schema.build()?;
        Ok(())
    }

    /// Backoff policy derived from the retry section
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry.max_attempts)
            .with_base(ErrorClass::Timeout, Duration::from_secs(self.retry.timeout_base_secs))
            .with_base(
                ErrorClass::ServiceUnavailable,
                Duration::from_secs(self.retry.unavailable_base_secs),
            )
            .with_base(
                ErrorClass::RateLimited,
                Duration::from_secs(self.retry.rate_limited_base_secs),
            )
            .with_base(ErrorClass::Other, Duration::from_secs(self.retry.other_base_secs))
    }

    /// Resolve the API key for `key_number`, falling back to key 1.
    ///
    /// Returns the key and the key number actually used.
    pub fn resolve_api_key(&self, key_number: u32) -> std::result::Result<(String, u32), SetupError> {
        let prefix = &self.gemini.api_key_env_prefix;
        let requested = format!("{}{}", prefix, key_number);
        let fallback = format!("{}1", prefix);

        if let Some(key) = non_empty_env(&requested) {
            return Ok((key, key_number));
        }
        if let Some(key) = non_empty_env(&fallback) {
            tracing::warn!("{} not set, using {} instead", requested, fallback);
            return Ok((key, 1));
        }
        Err(SetupError::MissingCredentials { requested, fallback })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Source documents, laid out as `<input_root>/<group>/<file>`
    pub input_root: PathBuf,
    /// Terminal artifacts, laid out as `<output_root>/<group>/<file>.json`
    pub output_root: PathBuf,
    /// Per-worker shard files
    pub shard_dir: PathBuf,
    /// Consolidated store written by `merge-shards`
    pub store_path: PathBuf,
    /// Append-only telemetry log (JSON lines)
    pub telemetry_log: PathBuf,
    /// Summary artifact recomputed on demand
    pub summary_path: PathBuf,
    /// Permanently failed items (JSON lines)
    pub failure_ledger: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("input_pdfs"),
            output_root: PathBuf::from("extracted_json"),
            shard_dir: PathBuf::from("results/shards"),
            store_path: PathBuf::from("results/extracted_data.csv"),
            telemetry_log: PathBuf::from("performance_logs/extraction_performance.jsonl"),
            summary_path: PathBuf::from("performance_logs/extraction_summary.json"),
            failure_ledger: PathBuf::from("performance_logs/failed_items.jsonl"),
        }
    }
}

/// Source validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Smaller sources are treated as corrupt (default: 1KB)
    pub min_bytes: u64,
    /// Ceiling accepted by the extraction service (default: 20MB)
    pub max_bytes: u64,
    /// Leading bytes every source must start with (default: "%PDF")
    pub required_signature: Option<String>,
    /// File extensions picked up by the inventory scan
    pub extensions: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            max_bytes: 20 * 1024 * 1024,
            required_signature: Some("%PDF".to_string()),
            extensions: vec!["pdf".to_string()],
        }
    }
}

/// Retry schedule for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per item, including the first (default: 5)
    pub max_attempts: u32,
    /// Base delay after a timeout (default: 120s)
    pub timeout_base_secs: u64,
    /// Base delay after a 503 (default: 60s)
    pub unavailable_base_secs: u64,
    /// Base delay after a quota/429 error (default: 60s)
    pub rate_limited_base_secs: u64,
    /// Base delay after any other error (default: 30s)
    pub other_base_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_base_secs: 120,
            unavailable_base_secs: 60,
            rate_limited_base_secs: 60,
            other_base_secs: 30,
        }
    }
}

/// Size-based attempt timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Sources above this size are "large" (default: 5MB)
    pub large_threshold: u64,
    /// Sources above this size are "very large" (default: 8MB)
    pub very_large_threshold: u64,
    /// Attempt timeout for normal sources (default: 600s)
    pub normal_timeout_secs: u64,
    /// Attempt timeout for large sources (default: 900s)
    pub large_timeout_secs: u64,
    /// Attempt timeout for very large sources (default: 1200s)
    pub very_large_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            large_threshold: 5 * 1024 * 1024,
            very_large_threshold: 8 * 1024 * 1024,
            normal_timeout_secs: 600,
            large_timeout_secs: 900,
            very_large_timeout_secs: 1200,
        }
    }
}

impl TimeoutConfig {
    /// Classify a source into a tier based on size
    pub fn tier_for_size(&self, size_bytes: u64) -> SizeTier {
        if size_bytes > self.very_large_threshold {
            SizeTier::VeryLarge
        } else if size_bytes > self.large_threshold {
            SizeTier::Large
        } else {
            SizeTier::Normal
        }
    }

    /// Get the attempt timeout for a given tier
    pub fn timeout_for_tier(&self, tier: SizeTier) -> Duration {
        let secs = match tier {
            SizeTier::Normal => self.normal_timeout_secs,
            SizeTier::Large => self.large_timeout_secs,
            SizeTier::VeryLarge => self.very_large_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Per-item lock behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A lease whose heartbeat is older than this may be reclaimed (default: 900s)
    pub stale_after_secs: u64,
    /// How often a holder refreshes its heartbeat (default: 60s)
    pub heartbeat_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 900,
            heartbeat_secs: 60,
        }
    }
}

/// Request quota accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Fleet-wide daily request ceiling used in summaries (default: 100)
    pub daily_ceiling: u64,
    /// Per-worker daily request budget when `--quota` is not given (default: 100)
    pub worker_quota: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_ceiling: 100,
            worker_quota: 100,
        }
    }
}

/// Delays between items
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Pause after a successful extraction (default: 180s)
    pub after_success_secs: u64,
    /// Pause after skipping a busy item (default: 2s)
    pub after_busy_secs: u64,
    /// Items sent to the service per run, not counting already-done skips (default: 350)
    pub max_items_per_run: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            after_success_secs: 180,
            after_busy_secs: 2,
            max_items_per_run: 350,
        }
    }
}

/// Shard merge behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Attempts to replace the store before giving up (default: 5)
    pub max_attempts: u32,
    /// Linear backoff step between attempts (default: 500ms)
    pub backoff_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 500,
        }
    }
}

/// Declared shard row schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Payload fields carried into shard rows, in column order
    pub payload_fields: Vec<String>,
    /// Payload fields that must appear in every shard header
    pub required_fields: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            payload_fields: [
                "general_information",
                "wage_information",
                "pension_information",
                "leave_information",
                "termination_information",
                "overtime_information",
                "training_information",
                "homeoffice_information",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            required_fields: Vec::new(),
        }
    }
}

impl SchemaConfig {
    /// Build the typed schema, rejecting duplicate or unknown names
    pub fn build(&self) -> Result<ShardSchema> {
        let mut seen = HashSet::new();
        for field in &self.payload_fields {
            if !seen.insert(field.as_str()) {
                return Err(Error::Config(format!("Duplicate payload field '{}'", field)));
            }
        }
        for field in &self.required_fields {
            if !seen.contains(field.as_str()) {
                return Err(Error::Config(format!(
                    "Required field '{}' is not a declared payload field",
                    field
                )));
            }
        }
        ShardSchema::new(self.payload_fields.clone(), self.required_fields.clone())
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Gemini extraction service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// API base URL
    pub base_url: String,
    /// Model name (default: "gemini-2.5-flash")
    pub model: String,
    /// Environment variable prefix for API keys (`<prefix><n>`)
    pub api_key_env_prefix: String,
    /// Sampling temperature (default: 0.0 for deterministic output)
    pub temperature: f32,
    /// Nucleus sampling (default: 0.1)
    pub top_p: f32,
    /// Top-k sampling (default: 1)
    pub top_k: u32,
    /// Output token ceiling
    pub max_output_tokens: u32,
    /// Fixed seed for reproducible output
    pub seed: i64,
    /// Instruction sent with every source
    pub prompt: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env_prefix: "GOOGLE_API_KEY".to_string(),
            temperature: 0.0,
            top_p: 0.1,
            top_k: 1,
            max_output_tokens: 65536,
            seed: 42,
            prompt: "Extract the document's content into the requested JSON categories. \
                     Copy text literally; return only JSON."
                .to_string(),
        }
    }
}
