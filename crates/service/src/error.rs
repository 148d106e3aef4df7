//! Startup errors.

use std::path::PathBuf;

use bilicore_authn::AuthError;
use bilicore_reconcile::ReconcileError;
use bilicore_storage::ConfigError;
use thiserror::Error;

/// Result alias for service composition.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised while loading configuration or wiring components.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or has unknown fields.
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The signing key could not be loaded.
    #[error("invalid signing key: {0}")]
    SigningKey(#[source] AuthError),

    /// A job could not be registered.
    #[error("invalid job: {0}")]
    Job(#[from] ReconcileError),
}
