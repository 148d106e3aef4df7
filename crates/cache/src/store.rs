//! The shared, versioned cache.
//!
//! [`CacheStore`] layers versioned entries over any [`StorageBackend`]. Every
//! mutation is a compare-and-set against the exact bytes last observed, so
//! concurrent writers, invalidators and loaders on different instances
//! never silently overwrite each other.
//!
//! # Loads racing invalidations
//!
//! A miss records the raw bytes it saw (nothing, a tombstone, or an expired
//! envelope). After the loader returns, the populate is conditional on those
//! bytes being unchanged. An invalidation in the meantime always writes a new
//! tombstone, so a load that read the authoritative store before a write
//! cannot re-cache the pre-write value after the write's invalidation.
//!
//! Coalesced loads are keyed by the logical key and the version the miss
//! observed. Every mutation moves that version, so a miss issued after an
//! invalidation never joins a load that started before it.
//!
//! Every backend call is bounded by [`CacheConfig::op_timeout`]; a call that
//! runs over surfaces as [`CacheError::Unavailable`].

use std::{fmt, future::Future, time::Duration};

use bilicore_storage::{
    KeyValue, SharedClock, StorageBackend, StorageError, StorageResult, clock::saturating_add, prefix_end,
    with_timeout,
};
use bytes::Bytes;
use moka::future::Cache;

use crate::{
    config::CacheConfig,
    entry::{CacheEntry, Envelope, next_version},
    error::{CacheError, CacheResult, LoadError},
};

/// Builds the logical key of an entity within a cache family.
///
/// ```
/// assert_eq!(bilicore_cache::family_key("video", "BV1xx"), "video::BV1xx");
/// ```
#[must_use]
pub fn family_key(family: &str, id: &str) -> String {
    format!("{family}::{id}")
}

/// What a read found at a physical key.
enum Slot {
    Live { entry: CacheEntry, raw: Bytes },
    Vacant { raw: Option<Bytes>, version: Option<u64> },
}

impl Slot {
    fn expected(&self) -> Option<&[u8]> {
        match self {
            Self::Live { raw, .. } => Some(&raw[..]),
            Self::Vacant { raw, .. } => raw.as_deref(),
        }
    }

    fn version(&self) -> Option<u64> {
        match self {
            Self::Live { entry, .. } => Some(entry.version),
            Self::Vacant { version, .. } => *version,
        }
    }
}

/// Key of the coalesced load for a miss on `key` that observed `slot`.
fn flight_key(key: &str, slot: &Slot) -> String {
    format!("{key}@{}", slot.version().unwrap_or(0))
}

/// Versioned cache over a shared backend.
///
/// Cheap to clone; clones share the backend handle and the local in-flight
/// load table.
#[derive(Clone)]
pub struct CacheStore<B> {
    backend: B,
    config: CacheConfig,
    clock: SharedClock,
    inflight: Cache<String, Bytes>,
}

impl<B> fmt::Debug for CacheStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("key_prefix", &self.config.key_prefix())
            .field("inflight", &self.inflight.entry_count())
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + Clone> CacheStore<B> {
    /// Creates a cache over `backend`, reading time from `clock`.
    ///
    /// The clock must be the one the backend uses for its own TTLs.
    pub fn new(backend: B, config: CacheConfig, clock: SharedClock) -> Self {
        let inflight = Cache::builder()
            .max_capacity(config.max_inflight())
            .time_to_live(config.suppression_window())
            .build();
        Self { backend, config, clock, inflight }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn physical(&self, key: &str) -> Vec<u8> {
        format!("{}{key}", self.config.key_prefix()).into_bytes()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        with_timeout(self.config.op_timeout(), call, StorageError::timeout).await
    }

    async fn cas(
        &self,
        physical: &[u8],
        expected: Option<&[u8]>,
        envelope: &Envelope,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.bounded(self.backend.compare_and_set_with_ttl(physical, expected, envelope.encode(), ttl))
            .await
    }

    async fn read_slot(&self, key: &str) -> CacheResult<Slot> {
        let Some(raw) = self.bounded(self.backend.get(&self.physical(key))).await? else {
            return Ok(Slot::Vacant { raw: None, version: None });
        };

        let envelope = match Envelope::decode(key, &raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "treating corrupt cache entry as a miss");
                return Ok(Slot::Vacant { raw: Some(raw), version: None });
            },
        };

        let version = envelope.version;
        match envelope.into_entry(key, self.clock.now()) {
            Some(entry) => Ok(Slot::Live { entry, raw }),
            None => Ok(Slot::Vacant { raw: Some(raw), version: Some(version) }),
        }
    }

    /// Returns the cached value, or `None` on a miss.
    ///
    /// Entries past their own `expires_at` are misses even if the backend has
    /// not dropped them yet.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] when the backend cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        Ok(self.peek(key).await?.map(|entry| entry.value))
    }

    /// Like [`get`](Self::get) but returns the full entry, including its
    /// version.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] when the backend cannot be reached.
    pub async fn peek(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        match self.read_slot(key).await? {
            Slot::Live { entry, .. } => {
                tracing::trace!(key, version = entry.version, "cache hit");
                Ok(Some(entry))
            },
            Slot::Vacant { .. } => {
                tracing::trace!(key, "cache miss");
                Ok(None)
            },
        }
    }

    /// Stores `value` under `key` for `ttl` and returns the new version.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Unavailable`] when the backend cannot be reached
    /// - [`CacheError::Contention`] when every attempt lost a race
    #[tracing::instrument(skip(self, value), fields(len = value.len()))]
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<u64> {
        let physical = self.physical(key);
        for _ in 0..self.config.max_write_attempts() {
            let slot = self.read_slot(key).await?;
            let now = self.clock.now();
            let version = next_version(slot.version(), now);
            let envelope = Envelope::live(value.to_vec(), version, saturating_add(now, ttl));

            match self.cas(&physical, slot.expected(), &envelope, ttl).await {
                Ok(()) => {
                    tracing::debug!(version, "cache entry written");
                    return Ok(version);
                },
                Err(StorageError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(CacheError::Contention {
            key: key.to_owned(),
            attempts: self.config.max_write_attempts(),
        })
    }

    /// Stores `value` only if `key` currently holds no live entry.
    ///
    /// Returns `false` when a live entry exists or another writer got there
    /// first.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] when the backend cannot be reached.
    #[tracing::instrument(skip(self, value), fields(len = value.len()))]
    pub async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<bool> {
        let slot = self.read_slot(key).await?;
        if matches!(slot, Slot::Live { .. }) {
            return Ok(false);
        }
        self.write_over(key, &slot, value.to_vec(), ttl).await
    }

    /// Removes `key` unconditionally.
    ///
    /// The entry is replaced with a tombstone so that any load that missed
    /// before this call cannot repopulate it.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Unavailable`] when the backend cannot be reached
    /// - [`CacheError::Contention`] when every attempt lost a race
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        let physical = self.physical(key);
        for _ in 0..self.config.max_write_attempts() {
            let slot = self.read_slot(key).await?;
            let tombstone = self.tombstone_after(slot.version());
            match self.cas(&physical, slot.expected(), &tombstone, self.config.tombstone_ttl()).await {
                Ok(()) => {
                    tracing::debug!(version = tombstone.version, "cache entry invalidated");
                    return Ok(());
                },
                Err(StorageError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(CacheError::Contention {
            key: key.to_owned(),
            attempts: self.config.max_write_attempts(),
        })
    }

    /// Invalidates `key` only if its live entry is still at `expected_version`.
    ///
    /// Returns `false`, leaving the entry untouched, when the key is absent or
    /// holds any other version. Repeating a call with a stale version is
    /// therefore a no-op.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] when the backend cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn compare_and_invalidate(&self, key: &str, expected_version: u64) -> CacheResult<bool> {
        let Slot::Live { entry, raw } = self.read_slot(key).await? else {
            return Ok(false);
        };
        if entry.version != expected_version {
            tracing::debug!(current = entry.version, "version moved on; leaving entry");
            return Ok(false);
        }

        let tombstone = self.tombstone_after(Some(entry.version));
        match self
            .cas(&self.physical(key), Some(&raw[..]), &tombstone, self.config.tombstone_ttl())
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::Conflict) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the cached value, or runs `loader` and caches its result.
    ///
    /// Concurrent misses for the same key on this instance share one loader
    /// invocation as long as they observed the same entry version; every
    /// waiter receives the same value or the same error. A miss issued after
    /// an invalidation completed starts its own load.
    /// The shared flight is forgotten as soon as it completes (and at the
    /// latest after the configured suppression window), so later misses go
    /// back to the backend.
    ///
    /// Loader errors are never cached.
    ///
    /// # Errors
    ///
    /// - [`LoadError::Cache`] when the initial lookup fails
    /// - [`LoadError::Loader`] when the loader fails
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Bytes, LoadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: Send + Sync + 'static,
    {
        let slot = match self.read_slot(key).await? {
            Slot::Live { entry, .. } => return Ok(entry.value),
            vacant => vacant,
        };

        let flight_id = flight_key(key, &slot);
        let flight = async {
            let value = loader().await?;
            self.populate(key, &slot, &value, ttl).await;
            Ok::<Bytes, E>(value)
        };

        let entry = self
            .inflight
            .entry(flight_id.clone())
            .or_try_insert_with(flight)
            .await
            .map_err(LoadError::Loader)?;

        if entry.is_fresh() {
            self.inflight.invalidate(&flight_id).await;
        }
        Ok(entry.into_value())
    }

    /// Invalidates every entry of `family`. Returns how many live entries this
    /// call replaced with a tombstone.
    ///
    /// Corrupt entries are tombstoned too but not counted. An entry another
    /// writer replaced concurrently is left to that writer.
    ///
    /// # Errors
    ///
    /// [`CacheError::Unavailable`] when the backend cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_prefix(&self, family: &str) -> CacheResult<usize> {
        let start = self.physical(&format!("{family}::"));
        let entries: Vec<KeyValue> = match prefix_end(&start) {
            Some(end) => self.bounded(self.backend.get_range(start.clone()..end)).await?,
            None => self.bounded(self.backend.get_range(start.clone()..)).await?,
        };

        let now = self.clock.now();
        let mut evicted = 0usize;
        for kv in entries {
            let key = String::from_utf8_lossy(&kv.key[self.config.key_prefix().len()..]).into_owned();
            let (live, tombstone) = match Envelope::decode(&key, &kv.value) {
                Ok(envelope) if envelope.value.is_none() || envelope.is_expired(now) => continue,
                Ok(envelope) => (true, self.tombstone_after(Some(envelope.version))),
                Err(_) => (false, self.tombstone_after(None)),
            };

            match self.cas(&kv.key, Some(&kv.value[..]), &tombstone, self.config.tombstone_ttl()).await {
                Ok(()) if live => evicted += 1,
                Ok(()) | Err(StorageError::Conflict) => {},
                Err(err) => return Err(err.into()),
            }
        }

        tracing::info!(evicted, "cache family evicted");
        Ok(evicted)
    }

    fn tombstone_after(&self, previous: Option<u64>) -> Envelope {
        let now = self.clock.now();
        Envelope::tombstone(
            next_version(previous, now),
            saturating_add(now, self.config.tombstone_ttl()),
        )
    }

    async fn write_over(
        &self,
        key: &str,
        slot: &Slot,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let now = self.clock.now();
        let envelope = Envelope::live(value, next_version(slot.version(), now), saturating_add(now, ttl));
        match self.cas(&self.physical(key), slot.expected(), &envelope, ttl).await {
            Ok(()) => Ok(true),
            Err(StorageError::Conflict) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn populate(&self, key: &str, observed: &Slot, value: &Bytes, ttl: Duration) {
        match self.write_over(key, observed, value.to_vec(), ttl).await {
            Ok(true) => tracing::trace!(key, "cache populated after load"),
            Ok(false) => {
                tracing::debug!(key, "key changed during load; not caching loaded value");
            },
            Err(err) => {
                tracing::warn!(
                    target: "bilicore::degraded",
                    key,
                    error = %err,
                    "could not populate cache after load",
                );
            },
        }
    }
}
