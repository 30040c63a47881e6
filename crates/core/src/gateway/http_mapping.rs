//! Pure functions for mapping HTTP responses to gateway errors.
//!
//! The hosted database speaks HTTP; this module decides which statuses are
//! rejections (never retried) and which are transient (retried per policy).

use super::{GatewayError, RejectionReason};

/// Maps a non-success HTTP status code and response body to a [`GatewayError`].
///
/// - `400`, `422` -> rejected (validation)
/// - `401`, `403` -> rejected (permission)
/// - `409` -> rejected (conflict)
/// - `404` -> not found
/// - `408`, `504` -> timeout
/// - `429`, other `5xx` -> unavailable
///
/// # Examples
///
/// ```
/// use concierge_core::gateway::{gateway_error_from_status, GatewayError};
///
/// let error = gateway_error_from_status(503, "properties", "upstream down");
/// assert!(error.is_transient());
///
/// let error = gateway_error_from_status(403, "properties", "rls");
/// assert!(!error.is_transient());
/// ```
pub fn gateway_error_from_status(status: u16, table: &'static str, body: &str) -> GatewayError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        body.trim().to_string()
    };

    match status {
        400 | 422 => GatewayError::Rejected {
            reason: RejectionReason::Validation,
            message,
        },
        401 | 403 => GatewayError::Rejected {
            reason: RejectionReason::Permission,
            message,
        },
        409 => GatewayError::Rejected {
            reason: RejectionReason::Conflict,
            message,
        },
        404 => GatewayError::NotFound { table, id: message },
        408 | 504 => GatewayError::Timeout(message),
        429 | 500..=599 => GatewayError::Unavailable(message),
        _ => GatewayError::Connection(message),
    }
}
