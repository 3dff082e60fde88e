//! Retry utilities with exponential backoff and jitter.
//!
//! Remote commands fail transiently (connection resets, timeouts). The phase
//! orchestrator wraps every per-host operation in [`retry_if`] using the
//! [`RetryPolicy`] it was constructed with, so the retry schedule and the
//! definition of "retryable" live in one injected object instead of inside
//! the SSH channel.
//!
//! # Example
//!
//! ```ignore
//! use keel::retry::{retry_if, RetryPolicy};
//!
//! let policy = RetryPolicy::with_max_attempts(3);
//! let output = retry_if(
//!     &policy.config,
//!     "preflight on 10.0.0.1",
//!     policy.retryable,
//!     || async { task.run(&ctx, executor.as_ref()).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff schedule for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` (1-based), without jitter
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Retry policy injected into the phase orchestrator.
///
/// Pairs a backoff schedule with the predicate deciding which errors are
/// worth another attempt.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Backoff schedule
    pub config: RetryConfig,
    /// Returns true when the error may go away on retry
    pub retryable: fn(&Error) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            config: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(15),
                backoff_multiplier: 2.0,
            },
            retryable: Error::is_transient,
        }
    }
}

impl RetryPolicy {
    /// Policy with the default predicate and the given number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        let mut policy = Self::default();
        policy.config.max_attempts = attempts.max(1);
        policy
    }

    /// Policy that never retries
    pub fn never() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Execute an async operation, retrying only errors accepted by `should_retry`.
///
/// Errors rejected by the predicate are returned immediately. Uses
/// exponential backoff with jitter (0.5x to 1.5x) capped at `max_delay`.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay =
                    Duration::from_secs_f64(config.delay_after(attempt).as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}
