use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed-delay retry budget.
///
/// There is no backoff: `max_attempts` and `delay` bound the total wait to
/// roughly `(max_attempts - 1) * delay` plus the time spent in the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Pause between two attempts, in milliseconds
    pub delay_ms: u64,
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 250,
            max_attempts: 40,
        }
    }
}

/// Predicate that retries on every error.
///
/// Assertion failures and transport errors both mean "not converged yet".
pub fn retry_any<E>(_: &E) -> bool {
    true
}

/// Invoke `action` until it succeeds, the budget is spent, or `is_retryable`
/// rejects an error.
///
/// The error handed back is always the last one `action` produced, so the
/// root cause stays visible. A `max_attempts` of zero still runs once.
///
/// # Example
/// ```rust,ignore
/// let project = retry(RetryPolicy::default(), retry_any, || async {
///     bob.client().await?.project(&urn).await.map_err(anyhow::Error::from)
/// })
/// .await?;
/// ```
pub async fn retry<T, E, F, Fut, P>(policy: RetryPolicy, is_retryable: P, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match action().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "converged");
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(attempt, error = %e, "non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::debug!(attempt, error = %e, "retry budget exhausted");
                return Err(e);
            }
            Err(e) => {
                tracing::trace!(attempt, error = %e, "not converged yet");
            }
        }

        attempt += 1;
        tokio::time::sleep(policy.delay()).await;
    }
}

/// [`retry`] with the retry-any predicate.
pub async fn eventually<T, E, F, Fut>(policy: RetryPolicy, action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry(policy, retry_any, action).await
}
