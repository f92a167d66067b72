//! Bounded exponential backoff for connectivity-sensitive operations
//!
//! The policy carries no business logic: call sites hand it a closure that
//! performs one attempt, and it decides whether and when to try again. Only
//! wrap idempotent work (connect, read, upsert-by-id); a blind insert would
//! be duplicated by a retry.
//!
//! ```rust,ignore
//! let policy = RetryPolicy::default();
//! let pool = policy.run("connect postgres", || connect(&url)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry (milliseconds).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default ceiling for a single backoff sleep (milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Default multiplier between consecutive delays.
pub const DEFAULT_FACTOR: u32 = 2;

/// Errors that can tell a transient fault from a permanent one.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sleep before retry number `attempt` (1-based: the delay after the
    /// first failure is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    if e.is_transient() {
                        warn!(operation = name, attempts = attempt, error = %e, "Giving up");
                    }
                    return Err(e);
                },
            }
        }
    }
}
