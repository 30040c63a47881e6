//! Bounded retry of gateway calls.

use std::future::Future;

use concierge_core::gateway::GatewayError;
use concierge_core::policy::RetryPolicy;

/// The error that ended a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub error: GatewayError,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Runs `operation` until it succeeds or the policy gives up.
///
/// Non-retryable errors end the loop immediately.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if policy.should_retry(attempts, &error) => {
                let delay = policy.delay(attempts);
                tracing::warn!(
                    operation = label,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Gateway call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(RetryFailure { error, attempts }),
        }
    }
}
