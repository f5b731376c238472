//! Bounded retry with backoff for transaction conflicts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UnitError;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How many times a conflicting transaction is re-run, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (>= 1).
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); spreads competing writers apart.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Why [`run_with_retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt ended in a conflict.
    Exhausted { attempts: u32, last_error: String },
    /// A non-retryable failure; returned as soon as it happened.
    Failed(UnitError),
}

/// Run `attempt_fn` until it succeeds, fails with a non-conflict error, or the
/// policy runs out of attempts.
///
/// Each attempt is bounded by `timeout`. A timed-out attempt is dropped, which
/// rolls back its transaction, and surfaces as [`UnitError::StoreUnavailable`].
/// Every attempt gets a fresh call, so nothing computed by a failed attempt is reused.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &'static str,
    mut attempt_fn: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UnitError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(timeout, attempt_fn(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UnitError::StoreUnavailable(format!(
                "{operation} attempt {attempt} timed out after {timeout:?}"
            ))),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(UnitError::Conflict(msg)) if policy.should_retry(attempt) => {
                let delay = policy.delay_after(attempt);
                warn!(operation, attempt, ?delay, error = %msg, "conflict; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(UnitError::Conflict(msg)) => {
                warn!(operation, attempt, error = %msg, "conflict; giving up");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: msg,
                });
            }
            Err(other) => return Err(RetryError::Failed(other)),
        }
    }
}
