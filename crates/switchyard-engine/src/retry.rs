//! Retry with configurable backoff for executor hand-off.
//!
//! Only transient failures to *reach* the executor are retried here. A node
//! whose work ran and failed is never retried automatically; operators do
//! that through run control.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let factor = 2u64.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 200,
            max_ms: 5_000,
        }
    }
}

/// Errors that know whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for switchyard_types::SwitchyardError {
    fn is_retryable(&self) -> bool {
        switchyard_types::SwitchyardError::is_retryable(self)
    }
}

/// Call `f` up to `max_retries + 1` times, retrying only retryable errors.
///
/// When every attempt fails the last error is returned unchanged, so callers
/// can tell exhaustion (still retryable) from a hard failure.
pub async fn execute_with_retry<F, Fut, T, E>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    target: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    target_id = %target,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
