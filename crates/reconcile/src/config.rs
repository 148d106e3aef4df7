//! Engine and job configuration.
//!
//! Jobs are usually declared in the service's TOML file:
//!
//! ```toml
//! [[jobs]]
//! name = "video-sync"
//! store = "document"
//! interval = "5m"
//! lease = "2m"
//! renew_every = "30s"
//! refresh = "repopulate"
//! ```

use std::time::Duration;

use bilicore_storage::{ConfigError, RetryPolicy};
use bilicore_store::StoreKind;
use serde::{Deserialize, Serialize};

/// Default namespace of checkpoint records.
pub const DEFAULT_CHECKPOINT_PREFIX: &str = "checkpoint:";

/// Default prefix of the lock guarding each job.
pub const DEFAULT_LOCK_PREFIX: &str = "reconcile:";

/// Default TTL of entries written back by [`RefreshPolicy::Repopulate`].
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default pause between two scheduled runs of a job.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default job lease.
pub const DEFAULT_JOB_LEASE: Duration = Duration::from_secs(30);

/// Default lease renewal period during a run.
pub const DEFAULT_RENEW_EVERY: Duration = Duration::from_secs(10);

/// What a run does with a stale cache entry after invalidating it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Leave the key empty; the next read repopulates it.
    #[default]
    InvalidateOnly,
    /// Read the current record and write it back if the key is still empty.
    Repopulate,
}

/// Settings shared by every job of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcileConfig {
    checkpoint_prefix: String,

    lock_prefix: String,

    #[serde(with = "humantime_serde")]
    refresh_ttl: Duration,

    /// Retries for checkpoint reads and writes.
    checkpoint_retry: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            checkpoint_prefix: DEFAULT_CHECKPOINT_PREFIX.to_owned(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_owned(),
            refresh_ttl: DEFAULT_REFRESH_TTL,
            checkpoint_retry: RetryPolicy::default(),
        }
    }
}

#[bon::bon]
impl ReconcileConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for empty prefixes, a zero refresh TTL or an
    /// invalid retry policy.
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_CHECKPOINT_PREFIX.to_owned())] checkpoint_prefix: String,
        #[builder(into, default = DEFAULT_LOCK_PREFIX.to_owned())] lock_prefix: String,
        #[builder(default = DEFAULT_REFRESH_TTL)] refresh_ttl: Duration,
        #[builder(default)] checkpoint_retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        let config = Self { checkpoint_prefix, lock_prefix, refresh_ttl, checkpoint_retry };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`ReconcileConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_prefix.is_empty() {
            return Err(ConfigError::invalid("checkpoint_prefix", "must not be empty"));
        }
        if self.lock_prefix.is_empty() {
            return Err(ConfigError::invalid("lock_prefix", "must not be empty"));
        }
        if self.refresh_ttl.is_zero() {
            return Err(ConfigError::MustBePositive { field: "refresh_ttl", value: "0s".into() });
        }
        self.checkpoint_retry.validate()
    }

    /// Namespace of checkpoint records.
    #[must_use]
    pub fn checkpoint_prefix(&self) -> &str {
        &self.checkpoint_prefix
    }

    /// Prefix of job lock names.
    #[must_use]
    pub fn lock_prefix(&self) -> &str {
        &self.lock_prefix
    }

    /// TTL of repopulated entries.
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Retry policy for checkpoint I/O.
    #[must_use]
    pub fn checkpoint_retry(&self) -> &RetryPolicy {
        &self.checkpoint_retry
    }
}

/// One reconciliation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    name: String,

    /// Store whose changes the job reconciles.
    store: StoreKind,

    #[serde(with = "humantime_serde", default = "default_interval")]
    interval: Duration,

    #[serde(with = "humantime_serde", default = "default_lease")]
    lease: Duration,

    #[serde(with = "humantime_serde", default = "default_renew_every")]
    renew_every: Duration,

    #[serde(default)]
    refresh: RefreshPolicy,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_lease() -> Duration {
    DEFAULT_JOB_LEASE
}

fn default_renew_every() -> Duration {
    DEFAULT_RENEW_EVERY
}

#[bon::bon]
impl JobSpec {
    /// Creates a validated job.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the name is empty, a duration is zero, or
    /// the renewal period is not shorter than the lease.
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        store: StoreKind,
        #[builder(default = DEFAULT_INTERVAL)] interval: Duration,
        #[builder(default = DEFAULT_JOB_LEASE)] lease: Duration,
        #[builder(default = DEFAULT_RENEW_EVERY)] renew_every: Duration,
        #[builder(default)] refresh: RefreshPolicy,
    ) -> Result<Self, ConfigError> {
        let spec = Self { name, store, interval, lease, renew_every, refresh };
        spec.validate()?;
        Ok(spec)
    }

    /// Re-checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// See [`JobSpec::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        for (field, value) in
            [("interval", self.interval), ("lease", self.lease), ("renew_every", self.renew_every)]
        {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field, value: "0s".into() });
            }
        }
        if self.renew_every >= self.lease {
            return Err(ConfigError::invalid(
                "renew_every",
                format!("{:?} must be shorter than the lease {:?}", self.renew_every, self.lease),
            ));
        }
        Ok(())
    }

    /// Job name, unique per engine.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store the job reconciles.
    #[must_use]
    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Pause between scheduled runs.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Lease requested for each run.
    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// How often a running job renews its lease.
    #[must_use]
    pub fn renew_every(&self) -> Duration {
        self.renew_every
    }

    /// Treatment of stale entries.
    #[must_use]
    pub fn refresh(&self) -> RefreshPolicy {
        self.refresh
    }
}
