//! Bounded retry with exponential backoff and jitter for store calls.
//!
//! Only errors the caller classifies as transient are retried; conflicts and
//! missing objects are returned immediately so the caller can re-read.

use std::future::Future;
use std::time::Duration;

use pkg_constants::controller::{
    DEFAULT_MAX_TRANSIENT_RETRIES, REQUEUE_BASE_DELAY_MS, REQUEUE_MAX_DELAY_MS,
};
use pkg_state::error::StoreError;
use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_TRANSIENT_RETRIES,
            initial_delay: Duration::from_millis(REQUEUE_BASE_DELAY_MS),
            max_delay: Duration::from_millis(REQUEUE_MAX_DELAY_MS),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Un-jittered delay before retry number `failures` (1-based), capped.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// `delay_for` scaled by a random factor in `[0.5, 1.5)`.
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(self.delay_for(failures).as_secs_f64() * jitter)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is used up. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
                let delay = config.jittered_delay_for(attempt);
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

/// `retry_with_backoff` for store calls, retrying only backend failures.
pub async fn retry_store<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    retry_with_backoff(config, operation_name, StoreError::is_retryable, operation).await
}
