//! Service configuration file.
//!
//! Every section is optional and falls back to its component's defaults:
//!
//! ```toml
//! log_filter = "info,bilicore=debug"
//!
//! [signing_key]
//! kid = "2024-10"
//! seed = "<base64url Ed25519 seed>"
//!
//! [token]
//! default_ttl = "7d"
//!
//! [cache]
//! key_prefix = "Cache:"
//!
//! [lock]
//! instance_id = "api-1"
//!
//! [gateway]
//! call_timeout = "2s"
//!
//! [reconcile]
//! refresh_ttl = "1h"
//!
//! [[jobs]]
//! name = "user-sync"
//! store = "relational"
//! interval = "1m"
//! ```

use std::{collections::HashSet, fmt, path::Path};

use bilicore_authn::TokenConfig;
use bilicore_cache::CacheConfig;
use bilicore_coord::LockConfig;
use bilicore_gateway::GatewayConfig;
use bilicore_reconcile::{JobSpec, ReconcileConfig};
use bilicore_storage::ConfigError;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{ServiceError, ServiceResult};

/// Default filter when neither the file nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default key id of a generated signing key.
pub const DEFAULT_KID: &str = "default";

/// Which key signs session tokens.
///
/// Without a seed a fresh key is generated at startup, so tokens do not
/// survive a restart and are not accepted by other instances.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKeyConfig {
    /// Key id placed in token headers.
    #[serde(default = "default_kid")]
    pub kid: String,
    /// Base64url 32-byte Ed25519 seed.
    #[serde(default)]
    pub seed: Option<String>,
}

fn default_kid() -> String {
    DEFAULT_KID.to_owned()
}

impl Default for SigningKeyConfig {
    fn default() -> Self {
        Self { kid: DEFAULT_KID.to_owned(), seed: None }
    }
}

impl fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("kid", &self.kid)
            .field("seed", &self.seed.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Drop for SigningKeyConfig {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

/// Configuration of one service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    pub log_filter: Option<String>,
    /// Token signing key.
    pub signing_key: SigningKeyConfig,
    /// Token codec.
    pub token: TokenConfig,
    /// Shared cache.
    pub cache: CacheConfig,
    /// Lock coordinator.
    pub lock: LockConfig,
    /// Request gateway.
    pub gateway: GatewayConfig,
    /// Reconciliation engine.
    pub reconcile: ReconcileConfig,
    /// Scheduled reconciliation jobs.
    pub jobs: Vec<JobSpec>,
}

impl ServiceConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Parse`] for malformed TOML or unknown fields,
    /// [`ServiceError::Config`] for invalid values.
    pub fn from_toml_str(raw: &str) -> ServiceResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ServiceError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Validates every section and the job list.
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key.kid.is_empty() {
            return Err(ConfigError::invalid("signing_key.kid", "must not be empty"));
        }
        self.token.validate()?;
        self.cache.validate()?;
        self.lock.validate()?;
        self.gateway.validate()?;
        self.reconcile.validate()?;

        let mut names = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !names.insert(job.name()) {
                return Err(ConfigError::invalid("jobs", format!("duplicate job '{}'", job.name())));
            }
        }
        Ok(())
    }

    /// The effective log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use bilicore_reconcile::RefreshPolicy;
    use bilicore_store::StoreKind;

    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.gateway, GatewayConfig::default());
        assert!(config.jobs.is_empty());
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_full_document() {
        let config = ServiceConfig::from_toml_str(
            r#"
            log_filter = "debug"

            [signing_key]
            kid = "k2"

            [cache]
            key_prefix = "Test:"
            default_ttl = "5m"

            [lock]
            instance_id = "api-1"
            default_lease = "45s"

            [gateway]
            call_timeout = "250ms"

            [gateway.read_retry]
            max_retries = 4

            [[jobs]]
            name = "user-sync"
            store = "relational"
            interval = "30s"

            [[jobs]]
            name = "video-sync"
            store = "document"
            lease = "2m"
            renew_every = "20s"
            refresh = "repopulate"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_filter(), "debug");
        assert_eq!(config.signing_key.kid, "k2");
        assert_eq!(config.cache.key_prefix(), "Test:");
        assert_eq!(config.lock.instance_id(), "api-1");
        assert_eq!(config.gateway.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.gateway.read_retry().max_retries(), 4);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[1].store(), StoreKind::Document);
        assert_eq!(config.jobs[1].refresh(), RefreshPolicy::Repopulate);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServiceConfig::from_toml_str("[cache]\nttl = \"1m\"").unwrap_err();
        assert!(matches!(err, ServiceError::Parse(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServiceConfig::from_toml_str(
            "[[jobs]]\nname = \"j\"\nstore = \"relational\"\nlease = \"10s\"\nrenew_every = \"10s\"",
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));

        let dup = "[[jobs]]\nname = \"j\"\nstore = \"relational\"\n[[jobs]]\nname = \"j\"\nstore = \"document\"";
        assert!(matches!(ServiceConfig::from_toml_str(dup), Err(ServiceError::Config(_))));
    }

    #[test]
    fn test_seed_is_redacted() {
        let config = ServiceConfig::from_toml_str("[signing_key]\nseed = \"c2VjcmV0\"").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("REDACTED"));
    }
}
