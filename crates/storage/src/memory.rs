//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] is the reference implementation of [`StorageBackend`]:
//! a single process-wide map standing in for the shared cache / coordination
//! store. Every conditional primitive executes under one write lock, so it is
//! linearizable across all tasks sharing the backend, which is exactly the
//! property the lock coordinator needs from a real shared store.
//!
//! # Features
//!
//! - **Clock-driven TTL**: expiry is evaluated against an injected [`Clock`], lazily on every read,
//!   and eagerly by a background sweep
//! - **Ordered storage**: keys live in a [`BTreeMap`] for range scans
//! - **Cheap clones**: all clones share the same state
//!
//! # Example
//!
//! ```
//! use bilicore_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fail::fail_point;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    clock::{SharedClock, saturating_add, system_clock},
    error::{StorageError, StorageResult},
    types::KeyValue,
};

/// How often the background sweep looks for expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the sweep task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Bytes>,
    expiry: BTreeMap<Vec<u8>, DateTime<Utc>>,
}

impl Inner {
    fn is_expired(&self, key: &[u8], now: DateTime<Utc>) -> bool {
        self.expiry.get(key).is_some_and(|at| *at <= now)
    }

    fn live(&self, key: &[u8], now: DateTime<Utc>) -> Option<&Bytes> {
        if self.is_expired(key, now) { None } else { self.data.get(key) }
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>, expires_at: Option<DateTime<Utc>>) {
        match expires_at {
            Some(at) => {
                self.expiry.insert(key.clone(), at);
            },
            None => {
                self.expiry.remove(&key);
            },
        }
        self.data.insert(key, Bytes::from(value));
    }

    fn remove(&mut self, key: &[u8]) {
        self.data.remove(key);
        self.expiry.remove(key);
    }
}

/// In-memory storage backend.
///
/// # Shutdown
///
/// The background sweep stops automatically when all clones are dropped, or
/// explicitly via [`shutdown`](Self::shutdown). Reads never depend on the
/// sweep: expired keys are filtered on access.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    clock: SharedClock,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("keys", &self.inner.read().data.len()).finish()
    }
}

impl MemoryBackend {
    /// Creates a backend driven by the system clock.
    ///
    /// Must be called inside a Tokio runtime: it spawns the TTL sweep task.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Creates a backend whose expiry decisions use `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock,
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task holds only a weak reference so it never keeps the state alive.
        let weak = Arc::downgrade(&backend.inner);
        let clock = Arc::clone(&backend.clock);
        tokio::spawn(async move {
            sweep_expired_keys(weak, clock, shutdown_rx).await;
        });

        backend
    }

    /// Signals the background sweep to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of physically stored keys, including expired ones not yet swept.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.inner.read().data.len()
    }

    /// Removes every expired key now. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        purge(&self.inner, self.clock.now())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn conditional_put(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let now = self.now();
        let mut inner = self.inner.write();

        let matches = match (expected, inner.live(key, now)) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        inner.put(key.to_vec(), new_value, ttl.map(|ttl| saturating_add(now, ttl)));
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn purge(inner: &RwLock<Inner>, now: DateTime<Utc>) -> usize {
    let expired: Vec<Vec<u8>> = {
        let guard = inner.read();
        guard.expiry.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect()
    };
    if expired.is_empty() {
        return 0;
    }

    let mut guard = inner.write();
    let mut removed = 0;
    for key in expired {
        // Re-check under the write lock: the key may have been rewritten since the scan.
        if guard.is_expired(&key, now) {
            guard.remove(&key);
            removed += 1;
        }
    }
    removed
}

async fn sweep_expired_keys(
    inner: std::sync::Weak<RwLock<Inner>>,
    clock: SharedClock,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(SWEEP_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let removed = purge(&inner, clock.now());
        if removed > 0 {
            tracing::trace!(removed, "swept expired keys");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let now = self.now();
        Ok(self.inner.read().live(key, now).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.inner.write().put(key, value, None);
        Ok(())
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let expires_at = saturating_add(self.now(), ttl);
        self.inner.write().put(key, value, Some(expires_at));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.conditional_put(key, expected, new_value, None)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.conditional_put(key, expected, new_value, Some(ttl))
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        let now = self.now();
        let mut inner = self.inner.write();
        if !inner.live(key, now).is_some_and(|current| current[..] == *expected) {
            return Err(StorageError::Conflict);
        }
        inner.remove(key);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let now = self.now();
        let inner = self.inner.read();

        let (start, end) = slice_bounds(&range);
        if is_empty_range(start, end) {
            return Ok(Vec::new());
        }

        Ok(inner
            .data
            .range::<[u8], _>((start, end))
            .filter(|(key, _)| !inner.is_expired(key, now))
            .map(|(k, v)| KeyValue::new(Bytes::copy_from_slice(k), v.clone()))
            .collect())
    }

    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let (start, end) = slice_bounds(&range);
        if is_empty_range(start, end) {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let keys: Vec<Vec<u8>> =
            inner.data.range::<[u8], _>((start, end)).map(|(k, _)| k.clone()).collect();
        for key in &keys {
            inner.remove(key);
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        fail_point!("memory-health-check", |_| Err(StorageError::connection(
            "injected health check failure"
        )));
        let _unused = self.inner.read();
        Ok(())
    }
}

fn slice_bounds<R: RangeBounds<Vec<u8>>>(range: &R) -> (Bound<&[u8]>, Bound<&[u8]>) {
    let start = match range.start_bound() {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    };
    let end = match range.end_bound() {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    };
    (start, end)
}

/// `BTreeMap::range` panics on inverted or empty-exclusive bounds; treat those as empty.
fn is_empty_range(start: Bound<&[u8]>, end: Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}
