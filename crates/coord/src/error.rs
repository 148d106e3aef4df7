//! Lock coordination errors.

use std::time::Duration;

use bilicore_storage::StorageError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors returned by [`LockCoordinator`](crate::LockCoordinator).
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Another holder owns an unexpired lease on the lock.
    ///
    /// This is contention, not a failure: the caller skips its turn.
    #[error("Lock '{name}' is already held{}", holder.as_ref().map(|h| format!(" by {h}")).unwrap_or_default())]
    AlreadyHeld {
        /// Lock name.
        name: String,
        /// Current holder, when it could be observed.
        holder: Option<String>,
        /// When the current lease runs out, when it could be observed.
        lease_expires_at: Option<DateTime<Utc>>,
    },

    /// The caller's lease expired or was taken over.
    ///
    /// Work guarded by the lock must stop immediately. Never retried.
    #[error("Ownership of lock '{name}' was lost")]
    LostOwnership {
        /// Lock name.
        name: String,
    },

    /// The requested lease is shorter than the configured minimum.
    #[error("Lease {lease:?} for lock '{name}' is below the minimum {min:?}")]
    LeaseTooShort {
        /// Lock name.
        name: String,
        /// Requested lease.
        lease: Duration,
        /// Configured minimum.
        min: Duration,
    },

    /// The lock name is empty or contains control characters.
    #[error("Invalid lock name: {0:?}")]
    InvalidName(String),

    /// A stored lock record could not be decoded.
    #[error("Corrupt lock record for '{name}': {reason}")]
    Corrupt {
        /// Lock name.
        name: String,
        /// Decoder message.
        reason: String,
    },

    /// The coordination store failed.
    #[error("Lock store error: {0}")]
    Storage(#[from] StorageError),
}

impl LockError {
    /// Whether another holder owns the lock.
    #[must_use]
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::AlreadyHeld { .. })
    }

    /// Whether ownership was lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::LostOwnership { .. })
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only transient store failures qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let held = LockError::AlreadyHeld { name: "job-x".into(), holder: None, lease_expires_at: None };
        assert!(held.is_contended());
        assert!(!held.is_retryable());

        let lost = LockError::LostOwnership { name: "job-x".into() };
        assert!(lost.is_lost());
        assert!(!lost.is_retryable());

        assert!(LockError::from(StorageError::timeout()).is_retryable());
        assert!(!LockError::from(StorageError::internal("boom")).is_retryable());
    }

    #[test]
    fn test_display_names_holder() {
        let held = LockError::AlreadyHeld {
            name: "job-x".into(),
            holder: Some("node-a:1".into()),
            lease_expires_at: None,
        };
        assert_eq!(held.to_string(), "Lock 'job-x' is already held by node-a:1");
    }
}
