//! Retry and timeout helpers shared by every layer that talks to a backend.
//!
//! [`with_retry`] wraps an async operation with bounded retries. Unlike a
//! storage-specific helper it is generic over the error type: the caller
//! supplies the predicate that decides which failures are worth another
//! attempt. Conflicts and other definitive answers must never be retried.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added so that many
//!   callers failing together do not retry in lockstep

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default initial backoff.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Default backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Bounded exponential backoff policy.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bilicore_storage::RetryPolicy;
///
/// let policy = RetryPolicy::builder()
///     .max_retries(3)
///     .initial_backoff(Duration::from_millis(10))
///     .build()
///     .unwrap();
/// assert_eq!(policy.max_retries(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    initial_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryPolicy {
    /// Creates a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `initial_backoff` is zero or exceeds
    /// `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let policy = Self { max_retries, initial_backoff, max_backoff };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Re-checks invariants, for policies that arrived through deserialization.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "initial_backoff",
                value: "0s".into(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::BelowMinimum {
                field: "max_backoff",
                value: format!("{:?}", self.max_backoff),
                min: format!("{:?}", self.initial_backoff),
            });
        }
        Ok(())
    }

    /// Retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Upper bound on any single delay, before jitter.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Executes `operation`, retrying failures for which `is_retryable` holds.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `policy.max_retries()` retries are spent.
#[tracing::instrument(skip(policy, is_retryable, operation), fields(max_retries = policy.max_retries))]
pub async fn with_retry<F, Fut, T, E, P>(
    policy: &RetryPolicy,
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
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if is_retryable(&err) && attempt < policy.max_retries => {
                let delay = compute_backoff(policy, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0 && is_retryable(&err) {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Bounds `future` by `timeout`, mapping expiry to the caller's error.
pub async fn with_timeout<Fut, T, E>(
    timeout: Duration,
    future: Fut,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(on_timeout()),
    }
}

/// Computes the backoff duration for the given attempt number.
///
/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..50% of delay)`
#[must_use]
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(policy.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
