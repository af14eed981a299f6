//! Gemini client for structured extraction via the Generative Language API
//!
//! Sends the whole source inline with the extraction prompt and asks for a
//! JSON response.

use async_trait::async_trait;
use base64::Engine;
use std::time::Duration;

use super::extractor::{parse_payload, Extraction, Extractor, RemoteError, SourceContent, TokenUsage};
use crate::config::GeminiConfig;
use crate::error::Result;
use crate::retry::ErrorClass;

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 500;

/// Gemini extractor authenticated with an API key
pub struct GeminiExtractor {
    client: reqwest::Client,
    config: GeminiConfig,
    api_key: String,
}

impl GeminiExtractor {
    /// Create a new Gemini extractor
    ///
    /// # Arguments
    /// * `config` - Model, sampling and prompt settings
    /// * `api_key` - Key resolved from the environment
    pub fn new(config: GeminiConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Get the API endpoint URL
    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn build_request(&self, source: &SourceContent) -> GenerateRequest {
        let prompt = format!("{}\n\nDocument: {}", self.config.prompt, source.file_name);
        GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![
                    Part::Text { text: prompt },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: source.mime_type.clone(),
                            data: base64::engine::general_purpose::STANDARD.encode(&source.bytes),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
                max_output_tokens: self.config.max_output_tokens,
                seed: self.config.seed,
                response_mime_type: "application/json".to_string(),
            },
        }
    }
}

#[derive(serde::Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(serde::Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(serde::Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(serde::Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    seed: i64,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(serde::Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(serde::Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(serde::Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(serde::Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

/// Turn a response body into an extraction
fn parse_response(body: &str) -> std::result::Result<Extraction, RemoteError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::new(format!("Failed to parse Gemini response: {}", e)))?;

    let usage = response
        .usage_metadata
        .map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::new("No candidates in Gemini response"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(RemoteError::new(format!(
            "No text in Gemini response (finish reason: {})",
            reason
        )));
    }

    Ok(Extraction {
        payload: parse_payload(&text)?,
        usage,
    })
}

/// Map a transport failure to a remote error
fn transport_error(err: reqwest::Error) -> RemoteError {
    let remote = RemoteError::new(format!("Gemini request failed: {}", err));
    if err.is_timeout() {
        remote.with_class(ErrorClass::Timeout)
    } else if err.is_connect() {
        remote.with_class(ErrorClass::ServiceUnavailable)
    } else {
        remote
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
impl Extractor for GeminiExtractor {
    async fn extract(
        &self,
        source: &SourceContent,
        timeout: Duration,
    ) -> std::result::Result<Extraction, RemoteError> {
        let request = self.build_request(source);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(RemoteError::with_status(
                status.as_u16(),
                format!("Gemini generation failed: {}", truncate(&body)),
            ));
        }

        parse_response(&body)
    }

    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::classify_remote_error;
    use serde_json::json;

    fn extractor() -> GeminiExtractor {
        GeminiExtractor::new(GeminiConfig::default(), "test-key".to_string()).unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            extractor().endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn test_request_shape() {
        let source = SourceContent::new("cao.pdf", b"%PDF-1.7".to_vec());
        let request = serde_json::to_value(extractor().build_request(&source)).unwrap();

        let parts = &request["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().ends_with("Document: cao.pdf"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(parts[1]["inlineData"]["data"], "JVBERi0xLjc=");
        assert_eq!(request["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(request["generationConfig"]["seed"], 42);
    }

    #[test]
    fn test_parse_response_with_usage() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"wage_information\": \"scale A\"}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 300}
        })
        .to_string();

        let extraction = parse_response(&body).unwrap();
        assert_eq!(extraction.payload["wage_information"], "scale A");
        assert_eq!(extraction.usage.total(), 1500);
    }

    #[test]
    fn test_empty_candidate_is_other_error() {
        let body = json!({"candidates": [{"finishReason": "SAFETY"}]}).to_string();
        let err = parse_response(&body).unwrap_err();
        assert!(err.message.contains("SAFETY"));
        assert_eq!(classify_remote_error(&err), ErrorClass::Other);
    }

    #[test]
    fn test_truncate_long_bodies() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        assert_eq!(truncate(&long).len(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }
}
