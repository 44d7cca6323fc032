//! Bounded retry with exponential backoff and jitter
//!
//! Only used for steps that are safe to repeat: querying the proxy directory
//! (no identity-bearing request has been sent yet) and rewriting local files.
//! Remote registration and issuance are never retried here.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff settings for a repeatable step
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; values below 1 are treated as 1
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a given attempt budget and default delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Run exactly once
    pub fn once() -> Self {
        Self::with_max_attempts(1)
    }

    /// Same budget with a different starting delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Run `operation` until it succeeds, the budget is spent, or
/// `is_retryable` rejects an error
///
/// Returns the first success or the last error.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts || !is_retryable(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Giving up"
                );
                return Err(e);
            }
            Err(e) => {
                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
