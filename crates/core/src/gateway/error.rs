use thiserror::Error;

/// Errors that can occur when constructing a date range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("Invalid date range: start date must be before or equal to end date")]
    InvalidRange,
}

/// Why the gateway refused a write or read outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Validation,
    Permission,
    Conflict,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RejectionReason::Validation => "validation",
            RejectionReason::Permission => "permission",
            RejectionReason::Conflict => "conflict",
        };
        f.write_str(label)
    }
}

/// Errors returned by the remote data gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Rejected ({reason}): {message}")]
    Rejected {
        reason: RejectionReason,
        message: String,
    },
    #[error("{table} not found: {id}")]
    NotFound { table: &'static str, id: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Shorthand for a validation rejection.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Rejected {
            reason: RejectionReason::Validation,
            message: message.into(),
        }
    }

    /// Shorthand for a permission rejection.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Rejected {
            reason: RejectionReason::Permission,
            message: message.into(),
        }
    }

    /// Returns true for failures worth retrying (network, timeout, overload).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_) | GatewayError::Timeout(_) | GatewayError::Unavailable(_)
        )
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
