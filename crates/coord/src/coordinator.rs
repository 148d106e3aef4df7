//! Named, time-bounded locks shared across service instances.
//!
//! Every state change is a single conditional operation against the
//! coordination store:
//!
//! | Operation | Primitive |
//! |-----------|-----------|
//! | acquire | `compare_and_set_with_ttl(key, None, record, lease)`: create-if-absent-or-expired |
//! | renew   | `compare_and_set_with_ttl(key, Some(fence), record', lease)` |
//! | release | `compare_and_delete(key, fence)` |
//!
//! The stored key expires together with the lease, so a crashed holder
//! blocks others for at most one lease.

use std::{fmt, time::Duration};

use bilicore_storage::{SharedClock, StorageBackend, StorageError, clock::saturating_add};

use crate::{
    config::LockConfig,
    error::{LockError, LockResult},
    record::{LockHandle, LockRecord},
};

/// Acquires, renews and releases leases on named locks.
#[derive(Clone)]
pub struct LockCoordinator<B> {
    backend: B,
    config: LockConfig,
    clock: SharedClock,
}

impl<B> fmt::Debug for LockCoordinator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("instance_id", &self.config.instance_id())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> LockResult<()> {
    if name.is_empty() || name.chars().any(char::is_control) {
        return Err(LockError::InvalidName(name.to_owned()));
    }
    Ok(())
}

impl<B: StorageBackend> LockCoordinator<B> {
    /// Creates a coordinator over `backend`.
    ///
    /// The clock must be the one the backend uses for its own TTLs.
    pub fn new(backend: B, config: LockConfig, clock: SharedClock) -> Self {
        Self { backend, config, clock }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn key(&self, name: &str) -> Vec<u8> {
        format!("{}{name}", self.config.key_prefix()).into_bytes()
    }

    fn encode(record: &LockRecord) -> LockResult<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| {
            LockError::Storage(StorageError::serialization_with_source("lock record", e))
        })
    }

    fn new_holder_id(&self) -> String {
        format!("{}:{}", self.config.instance_id(), uuid::Uuid::new_v4().simple())
    }

    /// Takes the lock for `lease` if nobody holds an unexpired lease on it.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyHeld`] when another holder's lease is live
    /// - [`LockError::LeaseTooShort`] or [`LockError::InvalidName`] for bad input
    /// - [`LockError::Storage`] when the coordination store fails
    #[tracing::instrument(skip(self), fields(holder_id))]
    pub async fn acquire(&self, name: &str, lease: Duration) -> LockResult<LockHandle> {
        validate_name(name)?;
        if lease < self.config.min_lease() {
            return Err(LockError::LeaseTooShort {
                name: name.to_owned(),
                lease,
                min: self.config.min_lease(),
            });
        }

        let now = self.clock.now();
        let record = LockRecord {
            lock_name: name.to_owned(),
            holder_id: self.new_holder_id(),
            acquired_at: now,
            lease_expires_at: saturating_add(now, lease),
        };
        tracing::Span::current().record("holder_id", record.holder_id.as_str());
        let fence = Self::encode(&record)?;

        match self.backend.compare_and_set_with_ttl(&self.key(name), None, fence.clone(), lease).await {
            Ok(()) => {
                tracing::debug!(lease_expires_at = %record.lease_expires_at, "lock acquired");
                Ok(LockHandle { record, lease, fence })
            },
            Err(StorageError::Conflict) => {
                let current = self.inspect(name).await.ok().flatten();
                tracing::debug!(
                    holder = current.as_ref().map(|r| r.holder_id.as_str()),
                    "lock already held"
                );
                Err(LockError::AlreadyHeld {
                    name: name.to_owned(),
                    holder: current.as_ref().map(|r| r.holder_id.clone()),
                    lease_expires_at: current.map(|r| r.lease_expires_at),
                })
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Takes the lock with the configured default lease.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_default(&self, name: &str) -> LockResult<LockHandle> {
        self.acquire(name, self.config.default_lease()).await
    }

    /// Extends the lease by another `handle.lease()` from now, provided the
    /// store still holds exactly what this holder last wrote.
    ///
    /// # Errors
    ///
    /// - [`LockError::LostOwnership`] once the lease expired or another holder
    ///   took over; the caller must stop guarded work
    /// - [`LockError::Storage`] when the coordination store fails
    #[tracing::instrument(skip(self, handle), fields(name = %handle.name(), holder_id = %handle.holder_id()))]
    pub async fn renew(&self, handle: &mut LockHandle) -> LockResult<()> {
        let now = self.clock.now();
        if handle.record.is_expired(now) {
            tracing::warn!("lease expired before renewal");
            return Err(LockError::LostOwnership { name: handle.record.lock_name.clone() });
        }

        let record = LockRecord {
            lease_expires_at: saturating_add(now, handle.lease),
            ..handle.record.clone()
        };
        let fence = Self::encode(&record)?;

        match self
            .backend
            .compare_and_set_with_ttl(
                &self.key(&record.lock_name),
                Some(&handle.fence),
                fence.clone(),
                handle.lease,
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(lease_expires_at = %record.lease_expires_at, "lease renewed");
                handle.record = record;
                handle.fence = fence;
                Ok(())
            },
            Err(StorageError::Conflict) => {
                tracing::warn!("lock ownership lost");
                Err(LockError::LostOwnership { name: record.lock_name })
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Gives the lock up.
    ///
    /// Returns `false` without touching the store if the lease had already
    /// lapsed or been reassigned; a newer holder is never clobbered.
    ///
    /// # Errors
    ///
    /// [`LockError::Storage`] when the coordination store fails.
    #[tracing::instrument(skip(self, handle), fields(name = %handle.name(), holder_id = %handle.holder_id()))]
    pub async fn release(&self, handle: LockHandle) -> LockResult<bool> {
        match self.backend.compare_and_delete(&self.key(handle.name()), &handle.fence).await {
            Ok(()) => {
                tracing::debug!("lock released");
                Ok(true)
            },
            Err(StorageError::Conflict) => {
                tracing::debug!("lock no longer ours, release skipped");
                Ok(false)
            },
            Err(err) => Err(err.into()),
        }
    }

    /// The current unexpired lease on `name`, if any.
    ///
    /// # Errors
    ///
    /// [`LockError::Corrupt`] for undecodable records, or
    /// [`LockError::Storage`].
    pub async fn inspect(&self, name: &str) -> LockResult<Option<LockRecord>> {
        validate_name(name)?;
        let Some(raw) = self.backend.get(&self.key(name)).await? else {
            return Ok(None);
        };
        let record: LockRecord = serde_json::from_slice(&raw)
            .map_err(|e| LockError::Corrupt { name: name.to_owned(), reason: e.to_string() })?;
        Ok(Some(record).filter(|r| !r.is_expired(self.clock.now())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use bilicore_storage::{Clock, ManualClock, MemoryBackend, testutil::FlakyBackend};

    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn coordinator(clock: &ManualClock, instance: &str) -> LockCoordinator<MemoryBackend> {
        coordinator_on(MemoryBackend::with_clock(clock.shared()), clock, instance)
    }

    fn coordinator_on<B: StorageBackend>(backend: B, clock: &ManualClock, instance: &str) -> LockCoordinator<B> {
        LockCoordinator::new(
            backend,
            LockConfig::builder().instance_id(instance).build().unwrap(),
            clock.shared(),
        )
    }

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::with_clock(clock.shared());
        let a = coordinator_on(backend.clone(), &clock, "a");
        let b = coordinator_on(backend, &clock, "b");

        let handle = a.acquire("job-x", LEASE).await.unwrap();
        assert!(handle.holder_id().starts_with("a:"));

        match b.acquire("job-x", LEASE).await {
            Err(LockError::AlreadyHeld { holder, .. }) => {
                assert_eq!(holder.as_deref(), Some(handle.holder_id()));
            },
            other => panic!("expected AlreadyHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::with_clock(clock.shared());
        let a = coordinator_on(backend.clone(), &clock, "a");
        let b = coordinator_on(backend, &clock, "b");

        let mut stale = a.acquire("job-x", LEASE).await.unwrap();
        clock.advance(LEASE);
        let fresh = b.acquire("job-x", LEASE).await.unwrap();

        assert!(a.renew(&mut stale).await.unwrap_err().is_lost());
        assert!(!a.release(stale).await.unwrap(), "stale release must not clobber");
        assert_eq!(b.inspect("job-x").await.unwrap().unwrap().holder_id, fresh.holder_id());
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let clock = ManualClock::starting_now();
        let coord = coordinator(&clock, "a");

        let mut handle = coord.acquire("job-x", LEASE).await.unwrap();
        clock.advance(Duration::from_secs(20));
        coord.renew(&mut handle).await.unwrap();
        clock.advance(Duration::from_secs(20));

        // 40s after acquisition, still held thanks to the renewal at 20s.
        assert!(coord.acquire("job-x", LEASE).await.unwrap_err().is_contended());
        assert_eq!(handle.remaining(clock.now()), Duration::from_secs(10));
        coord.renew(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_after_local_expiry_is_lost_without_store_call() {
        let clock = ManualClock::starting_now();
        let backend = FlakyBackend::new(MemoryBackend::with_clock(clock.shared()));
        let coord = coordinator_on(backend.clone(), &clock, "a");

        let mut handle = coord.acquire("job-x", LEASE).await.unwrap();
        clock.advance(LEASE + Duration::from_secs(1));
        let calls = backend.calls();
        assert!(coord.renew(&mut handle).await.unwrap_err().is_lost());
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn test_release_frees_lock() {
        let clock = ManualClock::starting_now();
        let coord = coordinator(&clock, "a");

        let handle = coord.acquire("job-x", LEASE).await.unwrap();
        assert!(coord.release(handle).await.unwrap());
        assert!(coord.inspect("job-x").await.unwrap().is_none());
        coord.acquire("job-x", LEASE).await.unwrap();
    }

    #[tokio::test]
    async fn test_input_validation() {
        let clock = ManualClock::starting_now();
        let coord = coordinator(&clock, "a");

        assert!(matches!(
            coord.acquire("job-x", Duration::from_millis(999)).await,
            Err(LockError::LeaseTooShort { .. })
        ));
        assert!(matches!(coord.acquire("", LEASE).await, Err(LockError::InvalidName(_))));
        assert!(matches!(coord.acquire("job\n", LEASE).await, Err(LockError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable_storage_error() {
        let clock = ManualClock::starting_now();
        let backend = FlakyBackend::new(MemoryBackend::with_clock(clock.shared()));
        let coord = coordinator_on(backend.clone(), &clock, "a");

        let mut handle = coord.acquire("job-x", LEASE).await.unwrap();
        backend.set_unavailable(true);
        let err = coord.renew(&mut handle).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");

        backend.set_unavailable(false);
        coord.renew(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_reported() {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::with_clock(clock.shared());
        backend.set(b"lock:job-x".to_vec(), b"garbage".to_vec()).await.unwrap();
        let coord = coordinator_on(backend, &clock, "a");

        assert!(matches!(coord.inspect("job-x").await, Err(LockError::Corrupt { .. })));
        assert!(coord.acquire("job-x", LEASE).await.unwrap_err().is_contended());
    }
}
