//! Revoked token ids.
//!
//! A revocation entry only has to live as long as the token it revokes, so
//! every entry carries a TTL equal to the token's remaining lifetime and the
//! set stays bounded by the number of live sessions.

use std::{
    fmt,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bilicore_cache::{CacheStore, family_key};
use bilicore_storage::{SharedClock, StorageBackend, clock::saturating_add};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::{future::Cache, policy::EvictionPolicy};

use crate::error::AuthError;

/// Cache family holding revocation markers.
pub const REVOKED_FAMILY: &str = "revoked";

/// A set of revoked token ids.
#[async_trait]
pub trait RevocationSet: Send + Sync + fmt::Debug {
    /// Marks `token_id` revoked for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevocationUnavailable`] if the set cannot be written.
    async fn revoke(&self, token_id: &str, ttl: Duration) -> Result<(), AuthError>;

    /// Whether `token_id` is currently revoked.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RevocationUnavailable`] if the set cannot be read.
    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError>;
}

/// Revocation set shared by every instance through the cache tier.
///
/// Each revoked id is one cache entry under `revoked::{jti}`.
#[derive(Clone)]
pub struct CacheRevocationSet<B> {
    cache: CacheStore<B>,
}

impl<B> fmt::Debug for CacheRevocationSet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRevocationSet").field("cache", &self.cache).finish()
    }
}

impl<B: StorageBackend + Clone> CacheRevocationSet<B> {
    /// Creates a revocation set over `cache`.
    pub fn new(cache: CacheStore<B>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<B: StorageBackend + Clone + 'static> RevocationSet for CacheRevocationSet<B> {
    async fn revoke(&self, token_id: &str, ttl: Duration) -> Result<(), AuthError> {
        self.cache
            .set(&family_key(REVOKED_FAMILY, token_id), Bytes::from_static(b"1"), ttl)
            .await
            .map(|_| ())
            .map_err(AuthError::RevocationUnavailable)
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        self.cache
            .get(&family_key(REVOKED_FAMILY, token_id))
            .await
            .map(|hit| hit.is_some())
            .map_err(AuthError::RevocationUnavailable)
    }
}

/// Expires each entry once its wall-clock deadline has passed.
struct DeadlineExpiry;

impl moka::Expiry<String, (DateTime<Utc>, Duration)> for DeadlineExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(DateTime<Utc>, Duration),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

/// Process-local revocation set for single-instance deployments and tests.
///
/// Entries are bounded by capacity (LRU) and expire by the injected clock.
pub struct InMemoryRevocationSet {
    revoked: Cache<String, (DateTime<Utc>, Duration)>,
    clock: SharedClock,
}

impl fmt::Debug for InMemoryRevocationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRevocationSet")
            .field("entries", &self.revoked.entry_count())
            .finish_non_exhaustive()
    }
}

impl InMemoryRevocationSet {
    /// Creates a set tracking at most `max_capacity` ids.
    pub fn new(max_capacity: u64, clock: SharedClock) -> Self {
        let revoked = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(DeadlineExpiry)
            .build();
        Self { revoked, clock }
    }
}

#[async_trait]
impl RevocationSet for InMemoryRevocationSet {
    async fn revoke(&self, token_id: &str, ttl: Duration) -> Result<(), AuthError> {
        let deadline = saturating_add(self.clock.now(), ttl);
        self.revoked.insert(token_id.to_owned(), (deadline, ttl)).await;
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        Ok(self
            .revoked
            .get(token_id)
            .await
            .is_some_and(|(deadline, _)| deadline > self.clock.now()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use bilicore_cache::CacheConfig;
    use bilicore_storage::{ManualClock, MemoryBackend, testutil::FlakyBackend};

    use super::*;

    #[tokio::test]
    async fn test_in_memory_revocation_respects_clock() {
        let clock = ManualClock::starting_now();
        let set = InMemoryRevocationSet::new(100, clock.shared());

        assert!(!set.is_revoked("jti-1").await.unwrap());
        set.revoke("jti-1", Duration::from_secs(30)).await.unwrap();
        assert!(set.is_revoked("jti-1").await.unwrap());
        assert!(!set.is_revoked("jti-2").await.unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(!set.is_revoked("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_capacity_eviction() {
        let clock = ManualClock::starting_now();
        let set = InMemoryRevocationSet::new(2, clock.shared());
        for jti in ["a", "b", "c", "d"] {
            set.revoke(jti, Duration::from_secs(300)).await.unwrap();
        }
        set.revoked.run_pending_tasks().await;
        assert!(set.revoked.entry_count() <= 2);
    }

    #[tokio::test]
    async fn test_cache_revocation_shared_between_instances() {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::with_clock(clock.shared());
        let a = CacheRevocationSet::new(CacheStore::new(
            backend.clone(),
            CacheConfig::default(),
            clock.shared(),
        ));
        let b = CacheRevocationSet::new(CacheStore::new(backend, CacheConfig::default(), clock.shared()));

        a.revoke("jti-9", Duration::from_secs(10)).await.unwrap();
        assert!(b.is_revoked("jti-9").await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(!b.is_revoked("jti-9").await.unwrap(), "entry lives only as long as the token");
    }

    #[tokio::test]
    async fn test_cache_revocation_unavailable() {
        let clock = ManualClock::starting_now();
        let flaky = FlakyBackend::new(MemoryBackend::with_clock(clock.shared()));
        let set = CacheRevocationSet::new(CacheStore::new(
            flaky.clone(),
            CacheConfig::default(),
            clock.shared(),
        ));

        flaky.set_unavailable(true);
        assert!(matches!(
            set.is_revoked("jti").await,
            Err(AuthError::RevocationUnavailable(ref e)) if e.is_unavailable()
        ));
        assert!(matches!(
            set.revoke("jti", Duration::from_secs(5)).await,
            Err(AuthError::RevocationUnavailable(_))
        ));
    }
}
