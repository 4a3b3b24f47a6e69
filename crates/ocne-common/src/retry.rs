//! Retry and polling utilities.
//!
//! Two shapes of waiting show up across the drivers:
//!
//! - transient API calls that should be retried with jittered exponential
//!   backoff ([`retry_with_backoff`]);
//! - polls against external state (node readiness, work requests, secrets)
//!   where each attempt can say "not yet", "done" or "give up now"
//!   ([`poll`] driven by a [`RetryStrategy`]).

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, trace, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success or until `max_attempts` is exhausted, returning the
/// last error in that case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
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

/// How a poll loop spaces its attempts and when it gives up.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed interval between attempts
    Linear {
        /// Delay between attempts
        interval: Duration,
        /// Wall-clock budget for the whole loop
        timeout: Duration,
    },
    /// Delay grows by `factor` after each attempt, capped at `max`
    Exponential {
        /// First delay
        start: Duration,
        /// Upper bound on a single delay
        max: Duration,
        /// Growth factor per attempt
        factor: f64,
        /// Wall-clock budget for the whole loop
        timeout: Duration,
    },
}

impl RetryStrategy {
    /// Linear strategy
    pub fn linear(interval: Duration, timeout: Duration) -> Self {
        Self::Linear { interval, timeout }
    }

    /// Exponential strategy
    pub fn exponential(start: Duration, max: Duration, factor: f64, timeout: Duration) -> Self {
        Self::Exponential {
            start,
            max,
            factor,
            timeout,
        }
    }

    /// Total time budget
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Linear { timeout, .. } | Self::Exponential { timeout, .. } => *timeout,
        }
    }

    /// Delay to sleep before the attempt that follows `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Self::Linear { interval, .. } => *interval,
            Self::Exponential {
                start, max, factor, ..
            } => {
                let exp = factor.powi(attempt.saturating_sub(1).min(64) as i32);
                let secs = (start.as_secs_f64() * exp).min(max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

/// Outcome of one poll attempt
#[derive(Debug)]
pub enum Poll<T> {
    /// Condition met
    Ready(T),
    /// Not yet; try again after the strategy's delay
    Pending,
    /// Give up immediately with this error
    Fail(Error),
}

/// Drive a poll function until it is ready, fails fast, or the strategy's
/// timeout elapses.
///
/// Retryable errors returned as `Err` by the functor are retried; any other
/// error ends the loop at once, as does [`Poll::Fail`]. On timeout the last
/// retried error, if any, is folded into the timeout message.
pub async fn poll<T, F, Fut>(strategy: &RetryStrategy, what: &str, mut check: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, Error>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut last_error: Option<Error> = None;

    loop {
        attempt += 1;
        match check().await {
            Ok(Poll::Ready(value)) => return Ok(value),
            Ok(Poll::Fail(e)) => return Err(e),
            Ok(Poll::Pending) => trace!(what, attempt, "condition not yet met"),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                trace!(what, attempt, error = %e, "poll attempt failed, retrying");
                last_error = Some(e);
            }
        }

        let delay = strategy.delay_after(attempt);
        if start.elapsed() + delay > strategy.timeout() {
            return Err(match last_error {
                Some(e) => Error::Timeout {
                    operation: format!("{what} (last error: {e})"),
                    seconds: strategy.timeout().as_secs(),
                },
                None => Error::timeout(what, strategy.timeout()),
            });
        }
        tokio::time::sleep(delay).await;
    }
}

/// Poll until `check` returns `Ok(true)` or the timeout elapses.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    what: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    poll(&RetryStrategy::linear(poll_interval, timeout), what, || {
        let fut = check();
        async move {
            Ok(match fut.await? {
                true => Poll::Ready(()),
                false => Poll::Pending,
            })
        }
    })
    .await
}
