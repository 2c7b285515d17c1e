//! Retry policy for failed tasks and storage outages.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::hlog_warn;

/// Default number of attempts a task gets before a failure is final.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Attempt limit plus exponential backoff schedule.
///
/// The delay after attempt `n` is `base_delay * multiplier^(n - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// A policy with zero delays, for tests and tight loops.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Whether a task that has been attempted `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the attempt following `attempts` (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are spent.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.next_delay(attempt);
                hlog_warn!("{} failed (attempt {}): {}; retrying in {:?}", what, attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
