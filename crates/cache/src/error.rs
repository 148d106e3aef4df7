//! Cache error types.

use std::sync::Arc;

use bilicore_storage::StorageError;
use thiserror::Error;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by [`CacheStore`](crate::CacheStore).
///
/// A version mismatch in `compare_and_invalidate` is not an error; it is the
/// `false` return value.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The backing store failed transiently. Callers degrade to the
    /// authoritative store instead of failing the request.
    #[error("cache backend unavailable: {source}")]
    Unavailable {
        /// Underlying backend failure.
        #[source]
        source: StorageError,
    },

    /// The backing store rejected the operation for a non-transient reason.
    #[error("cache backend error: {source}")]
    Backend {
        /// Underlying backend failure.
        #[source]
        source: StorageError,
    },

    /// A stored envelope could not be decoded.
    #[error("corrupt cache entry at {key}: {reason}")]
    Corrupt {
        /// Logical cache key.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// A versioned write kept losing races with other writers.
    #[error("cache write for {key} lost {attempts} consecutive races")]
    Contention {
        /// Logical cache key.
        key: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl CacheError {
    /// Returns `true` when the cache should be bypassed rather than trusted.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<StorageError> for CacheError {
    fn from(source: StorageError) -> Self {
        if source.is_transient() {
            Self::Unavailable { source }
        } else {
            Self::Backend { source }
        }
    }
}

/// Failure of [`CacheStore::get_or_load`](crate::CacheStore::get_or_load).
///
/// Loader errors are shared between every caller whose load was coalesced
/// into the same flight, hence the [`Arc`].
#[derive(Debug, Error)]
pub enum LoadError<E> {
    /// The cache itself failed before a load could be attempted.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The loader failed.
    #[error("loader failed: {0}")]
    Loader(Arc<E>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_storage_errors_map_to_unavailable() {
        assert!(CacheError::from(StorageError::timeout()).is_unavailable());
        assert!(CacheError::from(StorageError::connection("down")).is_unavailable());
        assert!(!CacheError::from(StorageError::internal("bug")).is_unavailable());
    }
}
