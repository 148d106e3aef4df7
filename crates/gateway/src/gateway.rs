//! Read-through and write-through orchestration.

use std::{collections::HashMap, fmt, sync::Arc};

use bilicore_authn::{SessionContext, TokenCodec};
use bilicore_cache::{CacheError, CacheStore, LoadError};
use bilicore_storage::{StorageBackend, StorageError, with_retry, with_timeout};
use bilicore_store::{
    AuthoritativeRecord, AuthoritativeStore, CachedRecord, EntityId, Revision, StoreError, StoreKind,
    StoreResult, cache_key,
};
use bytes::Bytes;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
};

/// Session header, cookie or form field carrying the serialized token.
pub const SESSION_FIELD: &str = "bilibili_token";

/// The entry point request handlers use for entity reads and writes.
///
/// Reads go through the cache and fall back to the authoritative store on a
/// miss. Writes go to the authoritative store first and invalidate the cache
/// entry after the store has committed, never before.
///
/// When the cache is unavailable, reads and writes proceed against the
/// authoritative store alone and the request does not fail.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ConsistencyGateway<B> {
    codec: TokenCodec,
    cache: CacheStore<B>,
    stores: HashMap<StoreKind, Arc<dyn AuthoritativeStore>>,
    config: GatewayConfig,
}

impl<B> fmt::Debug for ConsistencyGateway<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistencyGateway")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + Clone> ConsistencyGateway<B> {
    /// Creates a gateway with no stores registered.
    pub fn new(codec: TokenCodec, cache: CacheStore<B>, config: GatewayConfig) -> Self {
        Self { codec, cache, stores: HashMap::new(), config }
    }

    /// Registers the store of its kind, replacing any earlier one.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn AuthoritativeStore>) -> Self {
        self.stores.insert(store.kind(), store);
        self
    }

    /// The token codec sessions are validated with.
    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// The shared cache.
    #[must_use]
    pub fn cache(&self) -> &CacheStore<B> {
        &self.cache
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn store(&self, kind: StoreKind) -> GatewayResult<&dyn AuthoritativeStore> {
        self.stores.get(&kind).map(|store| store.as_ref()).ok_or(GatewayError::UnknownStore(kind))
    }

    /// Validates `token` and returns who is calling.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Auth`] when the session is rejected,
    /// [`GatewayError::Timeout`] when validation does not finish in time.
    #[tracing::instrument(skip_all)]
    pub async fn authenticate(&self, token: &str) -> GatewayResult<SessionContext> {
        with_timeout(
            self.config.call_timeout(),
            async { self.codec.session_context(token).await.map_err(GatewayError::from) },
            || GatewayError::Timeout { operation: "session validation" },
        )
        .await
    }

    /// Reads an entity through the cache.
    ///
    /// Concurrent misses for the same entity on this instance share one
    /// store read. Store reads are retried per
    /// [`GatewayConfig::read_retry`] and bounded by
    /// [`GatewayConfig::call_timeout`] per attempt.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Auth`] when the session is rejected
    /// - [`GatewayError::NotFound`] when the entity does not exist
    /// - [`GatewayError::Store`] when the store keeps failing
    /// - [`GatewayError::UnknownStore`] when `kind` is not registered
    #[tracing::instrument(skip_all, fields(%kind, %id))]
    pub async fn read(
        &self,
        token: &str,
        kind: StoreKind,
        id: &EntityId,
    ) -> GatewayResult<AuthoritativeRecord> {
        self.authenticate(token).await?;
        let store = self.store(kind)?;
        let key = cache_key(kind, id);

        let loaded = self
            .cache
            .get_or_load(&key, self.config.cache_ttl(), || async {
                tracing::trace!(key = %key, "cache miss");
                self.load(store, id).await.map(|record| CachedRecord::from(record).encode())
            })
            .await;

        match loaded {
            Ok(bytes) => match CachedRecord::decode(&bytes) {
                Ok(cached) => Ok(cached.into()),
                Err(err) => {
                    tracing::warn!(
                        target: "bilicore::consistency",
                        key = %key,
                        error = %err,
                        "undecodable cached record, evicting"
                    );
                    if let Err(err) = self.cache.invalidate(&key).await {
                        tracing::warn!(key = %key, error = %err, "failed to evict undecodable record");
                    }
                    self.load_direct(store, id).await
                },
            },
            Err(LoadError::Loader(err)) => Err(GatewayError::from_store(err)),
            Err(LoadError::Cache(err)) => {
                tracing::warn!(
                    target: "bilicore::degraded",
                    key = %key,
                    error = %err,
                    "cache unavailable, reading from the authoritative store"
                );
                self.load_direct(store, id).await
            },
        }
    }

    async fn load(&self, store: &dyn AuthoritativeStore, id: &EntityId) -> StoreResult<AuthoritativeRecord> {
        let timeout = self.config.call_timeout();
        with_retry(self.config.read_retry(), "store_read", StoreError::is_retryable, || {
            with_timeout(timeout, store.read(id), || StoreError::Timeout)
        })
        .await
    }

    async fn load_direct(
        &self,
        store: &dyn AuthoritativeStore,
        id: &EntityId,
    ) -> GatewayResult<AuthoritativeRecord> {
        self.load(store, id).await.map_err(|err| GatewayError::from_store(Arc::new(err)))
    }

    /// Writes an entity and invalidates its cache entry.
    ///
    /// The caller must be logged in. The write is never retried here; a
    /// retryable error is surfaced for the caller to decide. Once the store
    /// has committed, the write succeeds even if the invalidation fails; that
    /// case is logged under `bilicore::consistency` and the entry converges
    /// at the next reconciliation pass or when it expires.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Auth`] when the session is rejected or anonymous
    /// - [`GatewayError::Store`] when the store write fails
    /// - [`GatewayError::UnknownStore`] when `kind` is not registered
    #[tracing::instrument(skip_all, fields(%kind, %id, len = payload.len()))]
    pub async fn write(
        &self,
        token: &str,
        kind: StoreKind,
        id: &EntityId,
        payload: Bytes,
    ) -> GatewayResult<Revision> {
        self.authenticate(token).await?.check_logged_in()?;
        let store = self.store(kind)?;
        let key = cache_key(kind, id);

        let written =
            with_timeout(self.config.call_timeout(), store.write(id, payload), || StoreError::Timeout).await;
        match written {
            Ok(revision) => {
                self.invalidate_after_write(&key, Some(revision)).await;
                Ok(revision)
            },
            // The write may still have landed.
            Err(StoreError::Timeout) => {
                self.invalidate_after_write(&key, None).await;
                Err(GatewayError::from_store(Arc::new(StoreError::Timeout)))
            },
            Err(err) => Err(GatewayError::from_store(Arc::new(err))),
        }
    }

    async fn invalidate_after_write(&self, key: &str, revision: Option<Revision>) {
        let invalidated = with_timeout(self.config.call_timeout(), self.cache.invalidate(key), || {
            CacheError::Unavailable { source: StorageError::timeout() }
        })
        .await;

        match invalidated {
            Ok(()) => tracing::debug!(key, ?revision, "invalidated after write"),
            Err(err) => tracing::warn!(
                target: "bilicore::consistency",
                key,
                ?revision,
                error = %err,
                "write committed but cache invalidation failed"
            ),
        }
    }

    /// Invalidates the entity's entry only if it is still at `version`.
    ///
    /// `false` means a newer write replaced the entry; that is not an error.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Cache`] when the cache fails.
    #[tracing::instrument(skip_all, fields(%kind, %id, version))]
    pub async fn compare_and_invalidate(
        &self,
        kind: StoreKind,
        id: &EntityId,
        version: u64,
    ) -> GatewayResult<bool> {
        self.cache
            .compare_and_invalidate(&cache_key(kind, id), version)
            .await
            .map_err(GatewayError::Cache)
    }

    /// Evicts every cached entity of `kind`. Returns how many were live.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Cache`] when the cache fails.
    #[tracing::instrument(skip(self))]
    pub async fn evict_family(&self, kind: StoreKind) -> GatewayResult<usize> {
        let evicted = self.cache.invalidate_prefix(kind.as_str()).await.map_err(GatewayError::Cache)?;
        tracing::info!(%kind, evicted, "cache family evicted");
        Ok(evicted)
    }

    /// Evicts the cached entities of every registered store.
    ///
    /// Stops at the first family that fails; families already evicted stay
    /// evicted.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Cache`] when the cache fails.
    #[tracing::instrument(skip(self))]
    pub async fn evict_all(&self) -> GatewayResult<usize> {
        let mut kinds: Vec<StoreKind> = self.stores.keys().copied().collect();
        kinds.sort();

        let mut evicted = 0;
        for kind in kinds {
            evicted += self.evict_family(kind).await?;
        }
        Ok(evicted)
    }
}
