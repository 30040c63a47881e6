use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors surfaced by cached reads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The gateway failed and retries were exhausted (or the error was not retryable).
    #[error("Fetch failed for {key}: {source}")]
    Fetch { key: String, source: GatewayError },
    /// The in-flight fetch was dropped before it resolved.
    #[error("Fetch abandoned for {key}")]
    Abandoned { key: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// The underlying gateway error, if any.
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            CacheError::Fetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for cached reads.
pub type Result<T> = std::result::Result<T, CacheError>;
