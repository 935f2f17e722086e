//! Retry and timeout utilities.
//!
//! Transient failures (the service being unreachable) are retried with
//! capped exponential backoff; everything else is surfaced on the first
//! attempt. The caller decides which errors count as transient.

use std::future::Future;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

use tracing::debug;

/// How often a sign-in call is tried and how long to wait in between.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total calls allowed, counting the first one. `1` disables retries.
    pub max_attempts: usize,
    /// Pause after the first failed call; doubles after each further one.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A random extra pause in `0..=jitter` is added to every wait so that
    /// clients failing together do not retry together.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let backoff = self
            .initial_backoff
            .checked_mul(1 << doublings)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff));
        backoff + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }
}

/// Runs `op` until it succeeds, the policy runs out of attempts, or
/// `should_retry` rejects the error.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_scheduled",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Runs `future` for at most `timeout`; `Err` means it was dropped unfinished.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Uniform-enough pick in `0..=max`. Every `RandomState` is freshly keyed,
/// so hashing the attempt number gives an unpredictable value per call.
fn jitter_duration(max: Duration, attempt: usize) -> Duration {
    let span = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
    if span == 0 {
        return Duration::ZERO;
    }
    let draw = RandomState::new().hash_one(attempt);
    Duration::from_micros(draw % span.saturating_add(1))
}
