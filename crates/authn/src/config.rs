//! Token codec configuration.

use std::time::Duration;

use bilicore_storage::ConfigError;
use serde::{Deserialize, Serialize};

/// Default `iss` claim.
pub const DEFAULT_ISSUER: &str = "bilicore";

/// Default session lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest lifetime a caller may request.
pub const DEFAULT_MAX_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Renewal is only granted once the remaining lifetime drops below this.
pub const DEFAULT_RENEW_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for [`TokenCodec`](crate::TokenCodec).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenConfig {
    issuer: String,

    #[serde(with = "humantime_serde")]
    default_ttl: Duration,

    #[serde(with = "humantime_serde")]
    max_ttl: Duration,

    #[serde(with = "humantime_serde")]
    renew_window: Duration,

    /// Accept tokens when the revocation set cannot be consulted.
    revocation_fail_open: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_owned(),
            default_ttl: DEFAULT_TOKEN_TTL,
            max_ttl: DEFAULT_MAX_TOKEN_TTL,
            renew_window: DEFAULT_RENEW_WINDOW,
            revocation_fail_open: true,
        }
    }
}

#[bon::bon]
impl TokenConfig {
    /// Creates a validated token configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the issuer is empty, a lifetime is below one
    /// second, or `default_ttl` exceeds `max_ttl`.
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_ISSUER.to_owned())] issuer: String,
        #[builder(default = DEFAULT_TOKEN_TTL)] default_ttl: Duration,
        #[builder(default = DEFAULT_MAX_TOKEN_TTL)] max_ttl: Duration,
        #[builder(default = DEFAULT_RENEW_WINDOW)] renew_window: Duration,
        #[builder(default = true)] revocation_fail_open: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { issuer, default_ttl, max_ttl, renew_window, revocation_fail_open };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`TokenConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::invalid("issuer", "must not be empty"));
        }
        for (field, value) in [("default_ttl", self.default_ttl), ("max_ttl", self.max_ttl)] {
            if value < Duration::from_secs(1) {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: format!("{value:?}"),
                    min: "1s".into(),
                });
            }
        }
        if self.default_ttl > self.max_ttl {
            return Err(ConfigError::invalid("default_ttl", "must not exceed max_ttl"));
        }
        Ok(())
    }

    /// `iss` claim stamped on and required of every token.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Lifetime used when the caller has no preference.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Ceiling on requested lifetimes.
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// Remaining lifetime below which renewal is allowed.
    #[must_use]
    pub fn renew_window(&self) -> Duration {
        self.renew_window
    }

    /// Whether validation proceeds when the revocation set is unreachable.
    #[must_use]
    pub fn revocation_fail_open(&self) -> bool {
        self.revocation_fail_open
    }
}
