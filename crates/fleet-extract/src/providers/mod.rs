//! Remote extraction providers
//!
//! Workers talk to the service through the [`Extractor`] trait so the
//! backend can be swapped for tests.

mod extractor;
mod gemini;

pub use extractor::{
    normalize_json_text, parse_payload, Extraction, Extractor, RemoteError, SourceContent,
    TokenUsage,
};
pub use gemini::GeminiExtractor;
