//! Model client error types

use thiserror::Error;

/// Errors from model completion calls
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response failed schema validation after {attempts} attempts: {last_error}")]
    SchemaValidation { attempts: u32, last_error: String },
}

impl ModelError {
    /// Transient errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Network(e) => e.is_timeout() || e.is_connect(),
            ModelError::Api { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}
