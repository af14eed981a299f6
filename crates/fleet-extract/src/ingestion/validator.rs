//! Structural checks run before any remote call

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::ValidationConfig;
use crate::error::{Error, Result};

/// A source that passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedSource {
    pub size_bytes: u64,
}

/// Boundary check applied to every source before extraction.
///
/// Failures are never retried and consume no retry budget.
pub trait SourceValidator: Send + Sync {
    fn validate(&self, source: &Path) -> Result<ValidatedSource>;
}

/// Size-range and leading-signature validator
#[derive(Debug, Clone)]
pub struct FileSignatureValidator {
    min_bytes: u64,
    max_bytes: u64,
    signature: Option<Vec<u8>>,
}

impl FileSignatureValidator {
    pub fn new(min_bytes: u64, max_bytes: u64, signature: Option<&[u8]>) -> Self {
        Self {
            min_bytes,
            max_bytes,
            signature: signature.map(<[u8]>::to_vec),
        }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(
            config.min_bytes,
            config.max_bytes,
            config.required_signature.as_deref().map(str::as_bytes),
        )
    }
}

impl SourceValidator for FileSignatureValidator {
    fn validate(&self, source: &Path) -> Result<ValidatedSource> {
        let source_ref = source.display().to_string();
        let reject = |message: String| Error::validation(source_ref.clone(), message);

        let metadata = std::fs::metadata(source)
            .map_err(|e| reject(format!("cannot stat source: {}", e)))?;
        if !metadata.is_file() {
            return Err(reject("not a regular file".to_string()));
        }

        let size = metadata.len();
        let size_mb = size as f64 / (1024.0 * 1024.0);
        if size == 0 {
            return Err(reject("source is empty".to_string()));
        }
        if size < self.min_bytes {
            return Err(reject(format!(
                "source too small ({} bytes), likely corrupted",
                size
            )));
        }
        if size > self.max_bytes {
            return Err(reject(format!(
                "source too large ({:.1}MB), exceeds the {:.0}MB limit",
                size_mb,
                self.max_bytes as f64 / (1024.0 * 1024.0)
            )));
        }

        if let Some(signature) = &self.signature {
            let mut head = vec![0u8; signature.len()];
            File::open(source)
                .and_then(|mut file| file.read_exact(&mut head))
                .map_err(|e| reject(format!("cannot read header: {}", e)))?;
            if &head != signature {
                return Err(reject(format!(
                    "missing {} signature",
                    String::from_utf8_lossy(signature)
                )));
            }
        }

        Ok(ValidatedSource { size_bytes: size })
    }
}
