//! Remote extraction boundary

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::ErrorClass;

/// Failure of one remote extraction attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct RemoteError {
    /// HTTP status, when the service answered
    pub status: Option<u16>,
    pub message: String,
    /// Class decided at the call site; overrides classification
    pub class_hint: Option<ErrorClass>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            class_hint: None,
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class_hint = Some(class);
        self
    }

    /// The coordinator's own attempt deadline expired
    pub fn timed_out(after: Duration) -> Self {
        Self::new(format!("attempt timed out after {}s", after.as_secs()))
            .with_class(ErrorClass::Timeout)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Token accounting reported by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Structured result of a successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub payload: Value,
    pub usage: TokenUsage,
}

/// Source bytes handed to an extractor
#[derive(Debug, Clone)]
pub struct SourceContent {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SourceContent {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_for(&file_name).to_string();
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    /// Read a source from disk
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(file_name, bytes))
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

/// Opaque remote extraction service.
///
/// The coordinator owns the retry loop and enforces `timeout` per attempt;
/// implementations make exactly one request per call.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        source: &SourceContent,
        timeout: Duration,
    ) -> std::result::Result<Extraction, RemoteError>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model in use
    fn model(&self) -> &str;
}

/// Parse model output as a JSON object, repairing common artifacts if needed.
///
/// Text that does not parse as-is is trimmed to its outermost braces, stripped
/// of BOM and zero-width characters, and has curly quotes straightened.
pub fn parse_payload(raw: &str) -> std::result::Result<Value, RemoteError> {
    let parsed = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(_) => serde_json::from_str::<Value>(&normalize_json_text(raw))
            .map_err(|e| RemoteError::new(format!("model returned invalid JSON: {}", e)))?,
    };

    if parsed.is_object() {
        Ok(parsed)
    } else {
        Err(RemoteError::new("model returned JSON that is not an object"))
    }
}

/// Repair common model artifacts before JSON parsing
pub fn normalize_json_text(raw: &str) -> String {
    let trimmed = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    };

    trimmed
        .chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}'))
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' | '\u{201f}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_error_display() {
        assert_eq!(
            RemoteError::with_status(503, "overloaded").to_string(),
            "HTTP 503: overloaded"
        );
        let timeout = RemoteError::timed_out(Duration::from_secs(600));
        assert_eq!(timeout.class_hint, Some(ErrorClass::Timeout));
        assert!(timeout.to_string().contains("600s"));
    }

    #[test]
    fn test_parse_clean_payload() {
        let value = parse_payload(r#"{"wage_information": "scale “A”"}"#).unwrap();
        assert_eq!(value["wage_information"], "scale “A”");
    }

    #[test]
    fn test_parse_repairs_wrapped_payload() {
        let raw = "\u{feff}Here you go:\n```json\n{\u{200b}\u{201c}a\u{201d}: 1}\n```";
        assert_eq!(parse_payload(raw).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("no json here").is_err());
    }

    #[test]
    fn test_mime_from_name() {
        assert_eq!(SourceContent::new("a.PDF", vec![]).mime_type, "application/pdf");
        assert_eq!(SourceContent::new("a.bin", vec![]).mime_type, "application/octet-stream");
    }
}
