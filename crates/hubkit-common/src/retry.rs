//! Backoff scheduling, in-process retries and timeouts.
//!
//! The same [`RetryConfig`] drives two things: retrying an operation inside
//! one call ([`retry_with_backoff`], used while populating a cache) and
//! scheduling the next replay of a durable record ([`RetryConfig::retry_at`],
//! used by the background sync queue).

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Stretch each wait by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before attempt number `attempt` (1-indexed). The first attempt
    /// never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(steps) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(steps as i32);
        let capped = Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()));

        if !self.jitter {
            return capped;
        }
        capped + capped.mul_f64(jitter_fraction() * 0.25)
    }

    /// Whether `failures` failed attempts have used up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Earliest time (ms since epoch) the next attempt may run after
    /// `failures` failed attempts, the last one finishing at `now_ms`.
    pub fn retry_at(&self, failures: u32, now_ms: i64) -> i64 {
        let wait = self.delay_for_attempt(failures.saturating_add(1));
        now_ms.saturating_add(i64::try_from(wait.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Pseudo-random value in `0.0..=1.0` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}

/// Run `operation` until it succeeds or the attempt budget runs out,
/// sleeping between attempts. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= budget {
            warn!(attempt, error = %error, "Giving up");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        debug!(attempt, ?delay, error = %error, "Attempt failed, backing off");
        sleep(delay).await;
    }
}

/// Bound `operation` by `timeout`.
pub async fn with_timeout<T, F, Fut>(
    timeout: Duration,
    operation: F,
) -> Result<T, crate::HubKitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::HubKitError::Timeout(timeout))
}
