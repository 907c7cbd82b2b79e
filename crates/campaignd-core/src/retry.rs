//! Wraps a fallible operation with bounded retries and classified backoff.

use std::future::Future;
use std::time::Duration;

use campaignd_db::models::{BackoffStrategy, RetryConfig};
use tracing::warn;

/// Anything the retry executor can classify as worth another attempt.
pub trait Retryable {
    /// `true` if this error looks transient (network blip, 5xx, 429,
    /// timeout) and another attempt might succeed.
    fn is_retryable(&self) -> bool;
}

/// Delay before the attempt that follows the `attempt`-th failure
/// (1-indexed: `attempt=1` is the delay after the first failure).
pub fn delay_for_attempt(policy: &RetryConfig, attempt: u32) -> Duration {
    let ms = match policy.backoff {
        BackoffStrategy::Exponential => policy.initial_delay_ms.saturating_mul(1u64 << (attempt.saturating_sub(1))),
        BackoffStrategy::Linear => policy.initial_delay_ms.saturating_mul(attempt as u64),
        BackoffStrategy::Constant => policy.initial_delay_ms,
    };
    Duration::from_millis(ms)
}

/// Run `op` up to `policy.attempts` times, sleeping `delay_for_attempt`
/// between tries. Stops immediately (without sleeping) if the classifier
/// says the error is non-retryable. Returns the last error if every attempt
/// is exhausted.
///
/// The executor does not cap total wall time; callers impose that via a
/// per-call timeout on `op` itself.
pub async fn retry<T, E, F, Fut>(policy: &RetryConfig, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err.is_retryable();
                warn!(step = label, attempt, retryable, error = %err, "step attempt failed");
                if !retryable || attempt == attempts {
                    return Err(err);
                }
                let delay = delay_for_attempt(policy, attempt);
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
        }
    }

    // Unreachable in practice (the loop above always returns), but keeps
    // the function total without an `unwrap`.
    Err(last_err.expect("retry loop always produces an error on this path"))
}
