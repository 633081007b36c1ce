//! Retry policies for flaky instrument I/O.
//!
//! Connecting to an instrument over the network can fail transiently (the
//! device is still booting, a switch is renegotiating). `retry_async` runs
//! an operation until it succeeds or the policy gives up.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `operation` until it succeeds, returning the last error otherwise.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                tracing::warn!(attempt, max_attempts = attempts, error = %err, "operation failed, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err.context(format!("failed after {} attempts", attempts)));
            }
        }
    }
}
