//! Bounded retry with exponential backoff.
//!
//! Only errors classified retryable by `MirrorError::is_retryable` (transient
//! network failures) get another attempt. Auth rejections, missing references,
//! platform misses and digest mismatches fail on the first try.

use std::future::Future;
use std::time::Duration;

use regmirror_core::error::Result;

/// Retry schedule for one network operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy with near-zero delays, for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }
}

/// Run `op` under the policy, backing off between retryable failures.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op_name: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.base_delay;
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(error),
        }
    }

    unreachable!("retry loop returns on the final attempt")
}
