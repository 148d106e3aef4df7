//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the one seam every piece of shared state flows
//! through: cache entries, the token revocation set, lock records and
//! reconciliation checkpoints. It is deliberately small: bytes in, bytes out,
//! with TTL and three conditional primitives that the coordination layer
//! builds on.
//!
//! # Conditional primitives
//!
//! | Method | Semantics |
//! |--------|-----------|
//! | [`compare_and_set`](StorageBackend::compare_and_set) | create-if-absent-or-expired / update-if-unchanged |
//! | [`compare_and_set_with_ttl`](StorageBackend::compare_and_set_with_ttl) | same, and the stored value expires after `ttl` |
//! | [`compare_and_delete`](StorageBackend::compare_and_delete) | delete only if the stored bytes still match |
//!
//! A key whose TTL has elapsed is logically absent for every operation,
//! whether or not a background sweep has physically removed it yet.

use std::{ops::RangeBounds, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends must be `Send + Sync` and every conditional operation must be a
/// single atomic step against the shared store, never a read followed by a
/// separate write.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use bilicore_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Returns `Ok(None)` if the key is absent or expired.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, clearing any existing TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// - **`expected: None`**: insert-if-absent. Succeeds when the key does not exist or has
    ///   expired.
    /// - **`expected: Some(value)`**: update-if-unchanged. Succeeds only when the current value is
    ///   byte-for-byte equal to `value`.
    ///
    /// On success the new value is stored without a TTL.
    ///
    /// # Errors
    ///
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) when the precondition fails.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Like [`compare_and_set`](Self::compare_and_set), but the stored value
    /// expires after `ttl`.
    ///
    /// With `expected: None` this is the atomic "create-if-absent-or-expired"
    /// write that distributed lock acquisition relies on.
    ///
    /// # Errors
    ///
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) when the precondition fails.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()>;

    /// Deletes a key only if its current value equals `expected`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) when the key is absent, expired
    /// or holds different bytes.
    #[must_use = "compare-and-delete may fail with a conflict and errors must be handled"]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()>;

    /// Deletes a key. Deleting an absent key is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves all live key-value pairs within a range, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Deletes all keys within a range.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Verifies the backend can serve traffic.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}

/// Computes the exclusive upper bound for a prefix scan.
///
/// Returns `None` when every byte of the prefix is `0xFF` (the scan is then
/// unbounded above).
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"doc:"), Some(b"doc;".to_vec()));
    }

    #[test]
    fn test_prefix_end_carries_over_ff() {
        assert_eq!(prefix_end(&[b'a', 0xFF]), Some(vec![b'b']));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }
}
