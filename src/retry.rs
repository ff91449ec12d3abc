//! Bounded retry with increasing backoff.
//!
//! Used for the conflict-retry loop around workload patches and history writes, and for the
//! sign-off gate. Callers decide which errors are worth another attempt.

use crate::error::Error;
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflict()
    }
}

impl RetryPolicy {
    /// Conflicts on a merge patch are rare and clear up quickly.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        }
    }

    /// Three attempts, 3s then 6s apart.
    pub fn sign_off() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 3_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds, returns an error `is_retryable` rejects, or the attempt
/// bound is reached. The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with a terminal error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Retry only on optimistic-concurrency conflicts.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_with_backoff(policy, operation_name, Error::is_conflict, operation).await
}
