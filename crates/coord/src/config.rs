//! Lock coordinator configuration.

use std::time::Duration;

use bilicore_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default lease when the caller has no better estimate of its runtime.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Shortest lease accepted by default.
pub const DEFAULT_MIN_LEASE: Duration = Duration::from_secs(1);

/// Default namespace of lock records.
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Configuration for [`LockCoordinator`](crate::LockCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LockConfig {
    /// Identifies this process in holder ids.
    instance_id: String,

    key_prefix: String,

    #[serde(with = "humantime_serde")]
    default_lease: Duration,

    #[serde(with = "humantime_serde")]
    min_lease: Duration,
}

fn generated_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            instance_id: generated_instance_id(),
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            default_lease: DEFAULT_LEASE,
            min_lease: DEFAULT_MIN_LEASE,
        }
    }
}

#[bon::bon]
impl LockConfig {
    /// Creates a validated configuration.
    ///
    /// `instance_id` defaults to a random id.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the instance id or prefix is empty, the
    /// minimum lease is zero, or the default lease is below the minimum.
    #[builder]
    pub fn new(
        #[builder(into, default = generated_instance_id())] instance_id: String,
        #[builder(into, default = DEFAULT_KEY_PREFIX.to_owned())] key_prefix: String,
        #[builder(default = DEFAULT_LEASE)] default_lease: Duration,
        #[builder(default = DEFAULT_MIN_LEASE)] min_lease: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { instance_id, key_prefix, default_lease, min_lease };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`LockConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.is_empty() {
            return Err(ConfigError::invalid("instance_id", "must not be empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::invalid("key_prefix", "must not be empty"));
        }
        if self.min_lease.is_zero() {
            return Err(ConfigError::MustBePositive { field: "min_lease", value: "0s".into() });
        }
        if self.default_lease < self.min_lease {
            return Err(ConfigError::BelowMinimum {
                field: "default_lease",
                value: format!("{:?}", self.default_lease),
                min: format!("{:?}", self.min_lease),
            });
        }
        Ok(())
    }

    /// This process's id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Namespace of lock records.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Lease used when the caller does not choose one.
    #[must_use]
    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Shortest lease accepted.
    #[must_use]
    pub fn min_lease(&self) -> Duration {
        self.min_lease
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockConfig::builder().build().unwrap();
        assert_eq!(config.default_lease(), DEFAULT_LEASE);
        assert_eq!(config.key_prefix(), "lock:");
        assert!(!config.instance_id().is_empty());
    }

    #[test]
    fn test_default_lease_below_minimum_rejected() {
        let err = LockConfig::builder()
            .default_lease(Duration::from_millis(500))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "default_lease", .. }));
    }

    #[test]
    fn test_deserialize_keeps_explicit_instance() {
        let config: LockConfig =
            serde_json::from_str(r#"{"instance_id":"node-a","default_lease":"45s"}"#).unwrap();
        assert_eq!(config.instance_id(), "node-a");
        assert_eq!(config.default_lease(), Duration::from_secs(45));
    }
}
