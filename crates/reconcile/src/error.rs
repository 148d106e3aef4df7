//! Reconciliation errors.

use bilicore_cache::CacheError;
use bilicore_coord::LockError;
use bilicore_storage::StorageError;
use bilicore_store::{StoreError, StoreKind};
use thiserror::Error;

/// Result alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Why a run failed.
///
/// Lock contention is not represented here: a contended run is
/// [`RunOutcome::Skipped`](crate::RunOutcome::Skipped), and a compare-and-invalidate
/// that finds a newer entry is counted in the
/// [`RunReport`](crate::RunReport), not raised.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The job's lease expired or was taken over mid-run. The run stopped
    /// without committing its checkpoint.
    #[error("Lock for job '{job}' was lost mid-run")]
    LockLost {
        /// Job name.
        job: String,
    },

    /// The lock coordinator failed.
    #[error("Lock error: {0}")]
    Lock(#[source] LockError),

    /// The authoritative store failed while scanning.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The cache failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Reading or writing the checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] StorageError),

    /// The stored checkpoint could not be decoded.
    #[error("Corrupt checkpoint for job '{job}': {reason}")]
    CorruptCheckpoint {
        /// Job name.
        job: String,
        /// Decoder message.
        reason: String,
    },

    /// No job is registered under this name.
    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    /// A job names a store kind that is not registered.
    #[error("No {0} store registered")]
    MissingStore(StoreKind),

    /// A job with this name is already registered.
    #[error("Duplicate job '{0}'")]
    DuplicateJob(String),

    /// The run was cancelled by shutdown.
    #[error("Run of job '{job}' cancelled")]
    Cancelled {
        /// Job name.
        job: String,
    },

    /// A fault was injected for testing.
    #[error("Injected failure at {0}")]
    Injected(&'static str),
}

impl ReconcileError {
    /// Whether ownership was lost.
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. })
    }

    /// Whether the next scheduled tick is likely to succeed without
    /// intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LockLost { .. } | Self::Cancelled { .. } | Self::Injected(_) => true,
            Self::Lock(err) => err.is_retryable(),
            Self::Store(err) => err.is_retryable(),
            Self::Cache(err) => err.is_unavailable(),
            Self::Checkpoint(err) => err.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_lock(job: &str, err: LockError) -> Self {
        if err.is_lost() { Self::LockLost { job: job.to_owned() } } else { Self::Lock(err) }
    }
}
