//! Cache configuration.

use std::time::Duration;

use bilicore_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default namespace prepended to every physical cache key.
pub const DEFAULT_KEY_PREFIX: &str = "Cache:";

/// Default entry lifetime when the caller does not choose one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long an invalidation marker outlives the entry it replaced.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// Upper bound on how long a coalesced load stays visible locally.
pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);

/// Default capacity of the local in-flight load table.
pub const DEFAULT_MAX_INFLIGHT: u64 = 10_000;

/// Default bound on a single backend call.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on versioned write races before giving up.
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 16;

/// Configuration for [`CacheStore`](crate::CacheStore).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bilicore_cache::CacheConfig;
///
/// let config = CacheConfig::builder()
///     .default_ttl(Duration::from_secs(300))
///     .build()
///     .unwrap();
/// assert_eq!(config.key_prefix(), "Cache:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    key_prefix: String,

    #[serde(with = "humantime_serde")]
    default_ttl: Duration,

    #[serde(with = "humantime_serde")]
    tombstone_ttl: Duration,

    #[serde(with = "humantime_serde")]
    suppression_window: Duration,

    max_inflight: u64,

    max_write_attempts: u32,

    #[serde(with = "humantime_serde")]
    op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            default_ttl: DEFAULT_TTL,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

#[bon::bon]
impl CacheConfig {
    /// Creates a validated cache configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any duration is zero, `max_inflight` or
    /// `max_write_attempts` is zero, or the key prefix is empty.
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_KEY_PREFIX.to_owned())] key_prefix: String,
        #[builder(default = DEFAULT_TTL)] default_ttl: Duration,
        #[builder(default = DEFAULT_TOMBSTONE_TTL)] tombstone_ttl: Duration,
        #[builder(default = DEFAULT_SUPPRESSION_WINDOW)] suppression_window: Duration,
        #[builder(default = DEFAULT_MAX_INFLIGHT)] max_inflight: u64,
        #[builder(default = DEFAULT_MAX_WRITE_ATTEMPTS)] max_write_attempts: u32,
        #[builder(default = DEFAULT_OP_TIMEOUT)] op_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            key_prefix,
            default_ttl,
            tombstone_ttl,
            suppression_window,
            max_inflight,
            max_write_attempts,
            op_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`CacheConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::invalid("key_prefix", "must not be empty"));
        }
        for (field, value) in [
            ("default_ttl", self.default_ttl),
            ("tombstone_ttl", self.tombstone_ttl),
            ("suppression_window", self.suppression_window),
            ("op_timeout", self.op_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field, value: "0s".into() });
            }
        }
        if self.max_inflight == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_inflight",
                value: "0".into(),
                min: "1".into(),
            });
        }
        if self.max_write_attempts == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_write_attempts",
                value: "0".into(),
                min: "1".into(),
            });
        }
        Ok(())
    }

    /// Namespace prepended to every physical key.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Lifetime applied by callers that have no better TTL.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Lifetime of invalidation markers.
    #[must_use]
    pub fn tombstone_ttl(&self) -> Duration {
        self.tombstone_ttl
    }

    /// Upper bound on how long a coalesced load is kept locally.
    #[must_use]
    pub fn suppression_window(&self) -> Duration {
        self.suppression_window
    }

    /// Capacity of the local in-flight table.
    #[must_use]
    pub fn max_inflight(&self) -> u64 {
        self.max_inflight
    }

    /// Bound on versioned write races.
    #[must_use]
    pub fn max_write_attempts(&self) -> u32 {
        self.max_write_attempts
    }

    /// Bound on each backend call; slower calls fail as unavailable.
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }
}
