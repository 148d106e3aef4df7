//! Test helpers for code built on [`AuthoritativeStore`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;

use crate::{
    authoritative::AuthoritativeStore,
    error::{StoreError, StoreResult},
    types::{AuthoritativeRecord, Change, Cursor, EntityId, Revision, StoreKind},
};

#[derive(Debug, Default)]
struct Faults {
    reads_down: AtomicBool,
    writes_down: AtomicBool,
    scans_down: AtomicBool,
    /// Scans fail after yielding this many changes.
    scan_fail_after: Mutex<Option<usize>>,
    latency: Mutex<Option<Duration>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// Wraps a store with switchable failures and call counters.
///
/// Clones share the switches.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<dyn AuthoritativeStore>,
    faults: Arc<Faults>,
}

impl FlakyStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn AuthoritativeStore>) -> Self {
        Self { inner, faults: Arc::new(Faults::default()) }
    }

    /// Fails every `read` with [`StoreError::Unavailable`].
    pub fn set_reads_unavailable(&self, down: bool) {
        self.faults.reads_down.store(down, Ordering::SeqCst);
    }

    /// Fails every `write` with [`StoreError::Unavailable`].
    pub fn set_writes_unavailable(&self, down: bool) {
        self.faults.writes_down.store(down, Ordering::SeqCst);
    }

    /// Fails scans before their first change.
    pub fn set_scans_unavailable(&self, down: bool) {
        self.faults.scans_down.store(down, Ordering::SeqCst);
    }

    /// Makes scans fail after yielding `n` changes; `None` clears it.
    pub fn fail_scans_after(&self, n: Option<usize>) {
        *self.faults.scan_fail_after.lock() = n;
    }

    /// Delays reads and writes by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }

    /// Reads attempted so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.faults.reads.load(Ordering::SeqCst)
    }

    /// Writes attempted so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.faults.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AuthoritativeStore for FlakyStore {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    async fn read(&self, id: &EntityId) -> StoreResult<AuthoritativeRecord> {
        self.faults.reads.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.faults.reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected read failure"));
        }
        self.inner.read(id).await
    }

    async fn write(&self, id: &EntityId, payload: Bytes) -> StoreResult<Revision> {
        self.faults.writes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.faults.writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected write failure"));
        }
        self.inner.write(id, payload).await
    }

    fn scan_changes_since(&self, cursor: Option<&Cursor>) -> BoxStream<'_, StoreResult<Change>> {
        if self.faults.scans_down.load(Ordering::SeqCst) {
            return futures::stream::once(async { Err(StoreError::unavailable("injected scan failure")) })
                .boxed();
        }
        match *self.faults.scan_fail_after.lock() {
            None => self.inner.scan_changes_since(cursor),
            Some(n) => self
                .inner
                .scan_changes_since(cursor)
                .take(n)
                .chain(futures::stream::once(async {
                    Err(StoreError::unavailable("injected mid-scan failure"))
                }))
                .boxed(),
        }
    }
}
