//! Retry with capped, jittered exponential backoff.
//!
//! Used for optimistic-concurrency read-modify-write loops and for requeueing
//! reconciliations that failed with a transient error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub steps: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay before jitter.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Fraction of the delay added as random jitter (0.1 = up to +10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflict()
    }
}

impl RetryPolicy {
    /// Backoff for node update conflicts: 10ms, 50ms, 250ms.
    #[must_use]
    pub const fn conflict() -> Self {
        Self {
            steps: 4,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            factor: 5.0,
            jitter: 0.1,
        }
    }

    /// Backoff for requeued reconciliations.
    #[must_use]
    pub const fn requeue() -> Self {
        Self {
            steps: 6,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// A single attempt.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            steps: 1,
            ..Self::conflict()
        }
    }

    #[must_use]
    pub const fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`, with jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        base.mul_f64(1.0 + extra)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the policy's steps are exhausted. The last error is returned.
pub async fn retry_when<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let steps = policy.steps.max(1);
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(attempts = retry + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if should_retry(&e) && retry + 1 < steps => {
                let delay = policy.delay(retry);
                debug!(
                    attempt = retry + 1,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => {
                if retry > 0 {
                    warn!(attempts = retry + 1, error = %e, "Giving up after retries");
                }
                return Err(e);
            }
        }
    }
}

/// Retry a read-modify-write while it loses optimistic-concurrency races.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(policy, Error::is_conflict, operation).await
}
