//! Gateway configuration.

use std::time::Duration;

use bilicore_storage::{ConfigError, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Default deadline of one authoritative-store call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default lifetime of entries populated on a read miss.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for [`ConsistencyGateway`](crate::ConsistencyGateway).
///
/// ```toml
/// [gateway]
/// call_timeout = "2s"
/// cache_ttl = "1h"
///
/// [gateway.read_retry]
/// max_retries = 3
/// initial_backoff = "10ms"
/// max_backoff = "200ms"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    #[serde(with = "humantime_serde")]
    call_timeout: Duration,

    /// Applied to reads only; writes are never retried.
    read_retry: RetryPolicy,

    #[serde(with = "humantime_serde")]
    cache_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            read_retry: RetryPolicy::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[bon::bon]
impl GatewayConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero timeout or TTL, or an invalid retry
    /// policy.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CALL_TIMEOUT)] call_timeout: Duration,
        #[builder(default)] read_retry: RetryPolicy,
        #[builder(default = DEFAULT_CACHE_TTL)] cache_ttl: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { call_timeout, read_retry, cache_ttl };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`GatewayConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("call_timeout", self.call_timeout), ("cache_ttl", self.cache_ttl)] {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field, value: "0s".into() });
            }
        }
        self.read_retry.validate()
    }

    /// Deadline of one store or cache call.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Retry policy for authoritative reads.
    #[must_use]
    pub fn read_retry(&self) -> &RetryPolicy {
        &self.read_retry
    }

    /// TTL of entries populated on a read miss.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::builder().build().unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.call_timeout(), DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = GatewayConfig::builder().call_timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { field: "call_timeout", .. }));
    }
}
