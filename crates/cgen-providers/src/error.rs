//! Provider error types.

use thiserror::Error;

use cgen_models::ModelError;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Malformed output: {0}")]
    Malformed(#[from] ModelError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn generation_failed(msg: impl Into<String>) -> Self {
        Self::GenerationFailed(msg.into())
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Unavailable(_) | ProviderError::Network(_) => true,
            ProviderError::Upstream { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
