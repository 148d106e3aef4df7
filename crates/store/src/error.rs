//! Authoritative store errors.

use bilicore_storage::{BoxError, StorageError};
use thiserror::Error;

use crate::types::{EntityId, StoreKind};

/// Result alias for authoritative store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by an [`AuthoritativeStore`](crate::AuthoritativeStore).
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The entity does not exist.
    #[error("{kind} entity '{id}' not found")]
    NotFound {
        /// Store that was asked.
        kind: StoreKind,
        /// Missing entity.
        id: EntityId,
    },

    /// The store could not be reached.
    #[error("Store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
        /// Underlying error, when there is one.
        #[source]
        source: Option<BoxError>,
    },

    /// The call did not complete within its deadline.
    #[error("Store operation timed out")]
    Timeout,

    /// Concurrent writers kept replacing the entity underneath a write.
    #[error("Write to '{id}' lost {attempts} consecutive races")]
    Contention {
        /// Contended entity.
        id: EntityId,
        /// Attempts made.
        attempts: u32,
    },

    /// A cursor was not produced by this store.
    #[error("Invalid change cursor: {0:?}")]
    InvalidCursor(String),

    /// Stored data could not be decoded.
    #[error("Corrupt {what}: {reason}")]
    Corrupt {
        /// What was being decoded.
        what: String,
        /// Decoder message.
        reason: String,
    },

    /// The backing key-value store failed for a non-transient reason.
    #[error("Store backend error: {0}")]
    Backend(#[source] StorageError),
}

impl StoreError {
    /// Creates an `Unavailable` error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into(), source: None }
    }

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(kind: StoreKind, id: impl Into<EntityId>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Creates a `Corrupt` error.
    #[must_use]
    pub fn corrupt(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt { what: what.into(), reason: reason.into() }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Reads are retried on these; writes are never retried automatically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout | Self::Contention { .. })
    }

    /// Whether the entity is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Timeout => Self::Timeout,
            err if err.is_transient() => Self::Unavailable {
                message: err.to_string(),
                source: Some(std::sync::Arc::new(err)),
            },
            err => Self::Backend(err),
        }
    }
}
