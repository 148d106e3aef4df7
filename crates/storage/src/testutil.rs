//! Shared test utilities for code built on [`StorageBackend`].
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//! Downstream crates enable it in `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! bilicore-storage = { workspace = true, features = ["testutil"] }
//! ```

use std::{
    ops::RangeBounds,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    StorageBackend,
    clock::ManualClock,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    types::KeyValue,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`; the zero padding keeps lexicographic
/// order equal to numeric order for range tests.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a value tagged with a task ID and sequence number, e.g. `"task3-val42"`.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// A [`MemoryBackend`] driven by a fresh [`ManualClock`].
#[must_use]
pub fn manual_backend() -> (ManualClock, MemoryBackend) {
    let clock = ManualClock::starting_now();
    let backend = MemoryBackend::with_clock(clock.shared());
    (clock, backend)
}

#[derive(Debug, Default)]
struct Faults {
    reads_down: AtomicBool,
    writes_down: AtomicBool,
    deletes_down: AtomicBool,
    lost_acks: AtomicUsize,
    calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// A [`MemoryBackend`] wrapper with switchable failure modes.
///
/// Each class of operation can be taken down independently; a failing
/// operation returns [`StorageError::Connection`] without touching the
/// underlying data. Clones share both the data and the switches.
#[derive(Debug, Clone)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    faults: Arc<Faults>,
}

impl FlakyBackend {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: MemoryBackend) -> Self {
        Self { inner, faults: Arc::new(Faults::default()) }
    }

    /// The wrapped backend, bypassing every fault switch.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Takes every operation down (or back up).
    pub fn set_unavailable(&self, down: bool) {
        self.set_reads_unavailable(down);
        self.set_writes_unavailable(down);
        self.set_deletes_unavailable(down);
    }

    /// Fails `get`, `get_range` and `health_check`.
    pub fn set_reads_unavailable(&self, down: bool) {
        self.faults.reads_down.store(down, Ordering::SeqCst);
    }

    /// Fails `set`, `set_with_ttl` and both compare-and-set variants.
    pub fn set_writes_unavailable(&self, down: bool) {
        self.faults.writes_down.store(down, Ordering::SeqCst);
    }

    /// Fails `delete`, `compare_and_delete` and `clear_range`.
    pub fn set_deletes_unavailable(&self, down: bool) {
        self.faults.deletes_down.store(down, Ordering::SeqCst);
    }

    /// Applies the next `n` successful writes but reports each as a
    /// [`StorageError::Timeout`], as a network that drops the acknowledgement
    /// would.
    pub fn lose_next_write_acks(&self, n: usize) {
        self.faults.lost_acks.store(n, Ordering::SeqCst);
    }

    /// Delays every operation by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }

    /// Number of operations attempted so far, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, switch: &AtomicBool, op: &str) -> StorageResult<()> {
        self.faults.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.faults.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if switch.load(Ordering::SeqCst) {
            return Err(StorageError::connection(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn acknowledge(&self, applied: StorageResult<()>) -> StorageResult<()> {
        applied?;
        let lost = self
            .faults
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StorageError::timeout());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.enter(&self.faults.reads_down, "get").await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.enter(&self.faults.writes_down, "set").await?;
        self.acknowledge(self.inner.set(key, value).await)
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.enter(&self.faults.writes_down, "set_with_ttl").await?;
        self.acknowledge(self.inner.set_with_ttl(key, value, ttl).await)
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.enter(&self.faults.writes_down, "compare_and_set").await?;
        self.acknowledge(self.inner.compare_and_set(key, expected, new_value).await)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.enter(&self.faults.writes_down, "compare_and_set_with_ttl").await?;
        self.acknowledge(self.inner.compare_and_set_with_ttl(key, expected, new_value, ttl).await)
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        self.enter(&self.faults.deletes_down, "compare_and_delete").await?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.enter(&self.faults.deletes_down, "delete").await?;
        self.inner.delete(key).await
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        self.enter(&self.faults.reads_down, "get_range").await?;
        self.inner.get_range(range).await
    }

    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        self.enter(&self.faults.deletes_down, "clear_range").await?;
        self.inner.clear_range(range).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.enter(&self.faults.reads_down, "health_check").await?;
        self.inner.health_check().await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok` and return the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_ordering() {
        assert_eq!(make_key("test", 42), b"test:000042");
        assert!(make_key("k", 9) < make_key("k", 10));
    }

    #[test]
    fn test_make_tagged_value() {
        assert_eq!(make_tagged_value(3, 42), b"task3-val42");
    }

    #[tokio::test]
    async fn test_flaky_backend_switches() {
        let backend = FlakyBackend::new(MemoryBackend::new());
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        backend.set_reads_unavailable(true);
        let err = backend.get(b"k").await.unwrap_err();
        assert!(err.is_transient());

        backend.set_deletes_unavailable(true);
        assert!(backend.delete(b"k").await.is_err());
        assert!(backend.inner().get(b"k").await.unwrap().is_some());

        backend.set_unavailable(false);
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn test_lost_ack_applies_the_write() {
        let backend = FlakyBackend::new(MemoryBackend::new());
        backend.lose_next_write_acks(1);

        let err = backend.compare_and_set(b"k", None, b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout));
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v")));

        backend.set(b"k".to_vec(), b"w".to_vec()).await.unwrap();
    }

    #[test]
    fn test_assert_conflict_macro() {
        let result: StorageResult<()> = Err(StorageError::Conflict);
        assert_conflict!(result);
    }

    #[test]
    fn test_assert_storage_ok_macro() {
        let result: StorageResult<i32> = Ok(42);
        assert_eq!(assert_storage_ok!(result), 42);
    }
}
