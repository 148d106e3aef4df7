//! The reconciliation run state machine.
//!
//! One run of a job:
//!
//! 1. take the job lock, or skip the tick if another instance holds it
//! 2. load the checkpoint and scan the store's changes since its cursor
//! 3. for every change, invalidate the cached entity if it is older than the
//!    change, using compare-and-invalidate so a concurrent write-through wins
//! 4. commit the new cursor with compare-and-set and release the lock
//!
//! A failure anywhere before step 4 leaves the checkpoint untouched, so the
//! next run reprocesses the same changes. Reprocessing is idempotent: an
//! entry invalidated by the failed run is simply absent the second time.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use bilicore_cache::{CacheEntry, CacheStore};
use bilicore_coord::{LockCoordinator, LockError, LockHandle};
use bilicore_storage::{SharedClock, StorageBackend, clock::saturating_add};
use bilicore_store::{AuthoritativeStore, CachedRecord, Change, StoreKind, cache_key};
use fail::fail_point;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::{CheckpointStore, ReconciliationCheckpoint},
    config::{JobSpec, ReconcileConfig, RefreshPolicy},
    error::{ReconcileError, ReconcileResult},
    status::{JobState, JobStatus, RunOutcome, RunReport, SkipReason},
};

/// Runs reconciliation jobs on demand.
///
/// The engine never schedules itself; a [`Scheduler`](crate::Scheduler) (or
/// any other caller) invokes [`run`](Self::run).
pub struct ReconciliationEngine<B> {
    config: ReconcileConfig,
    coordinator: LockCoordinator<B>,
    cache: CacheStore<B>,
    checkpoints: CheckpointStore<B>,
    stores: HashMap<StoreKind, Arc<dyn AuthoritativeStore>>,
    jobs: BTreeMap<String, JobSpec>,
    statuses: Mutex<HashMap<String, JobStatus>>,
    clock: SharedClock,
}

impl<B> fmt::Debug for ReconciliationEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + Clone> ReconciliationEngine<B> {
    /// Creates an engine with no stores and no jobs.
    ///
    /// Checkpoints are kept on `checkpoint_backend`, normally the backend the
    /// coordinator and cache share.
    pub fn new(
        config: ReconcileConfig,
        coordinator: LockCoordinator<B>,
        cache: CacheStore<B>,
        checkpoint_backend: B,
        clock: SharedClock,
    ) -> Self {
        let checkpoints = CheckpointStore::new(
            checkpoint_backend,
            config.checkpoint_prefix(),
            *config.checkpoint_retry(),
        );
        Self {
            config,
            coordinator,
            cache,
            checkpoints,
            stores: HashMap::new(),
            jobs: BTreeMap::new(),
            statuses: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Registers the store of its kind, replacing any earlier one.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn AuthoritativeStore>) -> Self {
        self.stores.insert(store.kind(), store);
        self
    }

    /// Registers a job.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::MissingStore`] if the job's store is not registered,
    /// [`ReconcileError::DuplicateJob`] if the name is taken.
    pub fn with_job(mut self, spec: JobSpec) -> ReconcileResult<Self> {
        if !self.stores.contains_key(&spec.store()) {
            return Err(ReconcileError::MissingStore(spec.store()));
        }
        if self.jobs.contains_key(spec.name()) {
            return Err(ReconcileError::DuplicateJob(spec.name().to_owned()));
        }
        self.statuses.lock().insert(spec.name().to_owned(), JobStatus::default());
        self.jobs.insert(spec.name().to_owned(), spec);
        Ok(self)
    }

    /// Registered jobs, by name.
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.values()
    }

    /// Status of one job on this instance.
    #[must_use]
    pub fn status(&self, job: &str) -> Option<JobStatus> {
        self.statuses.lock().get(job).cloned()
    }

    /// Status of every job on this instance.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, JobStatus> {
        self.statuses.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Checkpoint storage, for inspection.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore<B> {
        &self.checkpoints
    }

    /// Runs `job` once.
    pub async fn run(&self, job: &str) -> RunOutcome {
        self.run_until(job, &CancellationToken::new()).await
    }

    /// Runs `job` once, stopping early without committing if `cancel` fires.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_until(&self, job: &str, cancel: &CancellationToken) -> RunOutcome {
        let Some(spec) = self.jobs.get(job) else {
            return RunOutcome::Failed(ReconcileError::UnknownJob(job.to_owned()));
        };

        {
            let mut statuses = self.statuses.lock();
            let status = statuses.entry(job.to_owned()).or_default();
            if status.is_busy() {
                tracing::debug!("run already in progress on this instance");
                return RunOutcome::Skipped(SkipReason::AlreadyRunning);
            }
            status.state = JobState::Acquiring;
            status.last_attempt_at = Some(self.clock.now());
        }

        let outcome = self.attempt(spec, cancel).await;

        match &outcome {
            RunOutcome::Succeeded(report) => tracing::info!(
                scanned = report.scanned,
                in_sync = report.in_sync,
                invalidated = report.invalidated,
                version_conflicts = report.version_conflicts,
                refreshed = report.refreshed,
                "reconciliation run succeeded"
            ),
            RunOutcome::Skipped(reason) => tracing::debug!(?reason, "reconciliation tick skipped"),
            RunOutcome::Failed(err) if err.is_lock_lost() => {
                tracing::warn!(error = %err, "reconciliation aborted after losing the lock");
            },
            RunOutcome::Failed(err) if err.is_transient() => {
                tracing::warn!(error = %err, "reconciliation run failed; retrying next tick");
            },
            RunOutcome::Failed(err) => tracing::error!(error = %err, "reconciliation run failed"),
        }

        if let Some(status) = self.statuses.lock().get_mut(job) {
            status.record(&outcome, self.clock.now());
        }
        outcome
    }

    fn set_state(&self, job: &str, state: JobState) {
        if let Some(status) = self.statuses.lock().get_mut(job) {
            status.state = state;
        }
    }

    async fn attempt(&self, spec: &JobSpec, cancel: &CancellationToken) -> RunOutcome {
        let lock_name = format!("{}{}", self.config.lock_prefix(), spec.name());
        let mut handle = match self.coordinator.acquire(&lock_name, spec.lease()).await {
            Ok(handle) => handle,
            Err(LockError::AlreadyHeld { holder, .. }) => {
                return RunOutcome::Skipped(SkipReason::Contended { holder });
            },
            Err(err) => return RunOutcome::Failed(ReconcileError::Lock(err)),
        };
        self.set_state(spec.name(), JobState::Running);

        match self.execute(spec, &mut handle, cancel).await {
            Ok(report) => {
                self.release(handle).await;
                RunOutcome::Succeeded(report)
            },
            // The lock may belong to someone else by now; leave it alone.
            Err(err) if err.is_lock_lost() => RunOutcome::Failed(err),
            Err(err) => {
                self.release(handle).await;
                RunOutcome::Failed(err)
            },
        }
    }

    async fn release(&self, handle: LockHandle) {
        match self.coordinator.release(handle).await {
            Ok(true) => {},
            Ok(false) => tracing::debug!("job lock had already lapsed at release"),
            Err(err) => tracing::warn!(error = %err, "failed to release job lock; it will lapse"),
        }
    }

    async fn execute(
        &self,
        spec: &JobSpec,
        handle: &mut LockHandle,
        cancel: &CancellationToken,
    ) -> ReconcileResult<RunReport> {
        let store = self
            .stores
            .get(&spec.store())
            .cloned()
            .ok_or(ReconcileError::MissingStore(spec.store()))?;

        let loaded = self.checkpoints.load(spec.name()).await?;
        let start = loaded.checkpoint.as_ref().and_then(|c| c.last_cursor.clone());
        tracing::debug!(cursor = start.as_ref().map(|c| c.as_str()), "scanning changes");

        let mut report = RunReport { new_cursor: start.clone(), ..RunReport::default() };
        let mut next_renewal = saturating_add(self.clock.now(), spec.renew_every());
        let mut changes = store.scan_changes_since(start.as_ref());

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(ReconcileError::Cancelled { job: spec.name().to_owned() });
                },
                next = changes.next() => next,
            };
            let Some(change) = next else { break };
            let change = change?;

            if self.clock.now() >= next_renewal {
                self.renew(spec, handle).await?;
                next_renewal = saturating_add(self.clock.now(), spec.renew_every());
            }

            report.scanned += 1;
            self.reconcile_change(spec, store.as_ref(), &change, &mut report).await?;
            report.new_cursor = Some(change.cursor);

            fail_point!("reconcile-after-change", |_| {
                Err(ReconcileError::Injected("reconcile-after-change"))
            });
        }

        // Ownership is re-checked right before the checkpoint moves.
        self.renew(spec, handle).await?;
        fail_point!("reconcile-before-checkpoint", |_| {
            Err(ReconcileError::Injected("reconcile-before-checkpoint"))
        });

        let next = ReconciliationCheckpoint {
            job_name: spec.name().to_owned(),
            last_run_at: self.clock.now(),
            last_cursor: report.new_cursor.clone(),
        };
        self.checkpoints.commit(&loaded, &next).await?;
        Ok(report)
    }

    async fn renew(&self, spec: &JobSpec, handle: &mut LockHandle) -> ReconcileResult<()> {
        self.coordinator.renew(handle).await.map_err(|err| ReconcileError::from_lock(spec.name(), err))
    }

    async fn reconcile_change(
        &self,
        spec: &JobSpec,
        store: &dyn AuthoritativeStore,
        change: &Change,
        report: &mut RunReport,
    ) -> ReconcileResult<()> {
        let key = cache_key(spec.store(), &change.id);
        match self.cache.peek(&key).await? {
            Some(observed) => self.reconcile_entry(spec, store, change, &key, observed, report).await,
            None if spec.refresh() == RefreshPolicy::Repopulate => {
                self.repopulate(store, change, &key, report).await
            },
            None => {
                report.in_sync += 1;
                Ok(())
            },
        }
    }

    /// Handles a change whose entity has a live cache entry `observed`.
    async fn reconcile_entry(
        &self,
        spec: &JobSpec,
        store: &dyn AuthoritativeStore,
        change: &Change,
        key: &str,
        observed: CacheEntry,
        report: &mut RunReport,
    ) -> ReconcileResult<()> {
        // Undecodable entries are treated as stale.
        if let Ok(cached) = CachedRecord::decode(&observed.value) {
            if cached.revision >= change.revision {
                report.in_sync += 1;
                return Ok(());
            }
        }

        if !self.cache.compare_and_invalidate(key, observed.version).await? {
            tracing::debug!(key, observed = observed.version, "entry rewritten concurrently; skipping");
            report.version_conflicts += 1;
            return Ok(());
        }
        tracing::trace!(key, revision = %change.revision, "stale entry invalidated");
        report.invalidated += 1;

        if spec.refresh() == RefreshPolicy::Repopulate {
            self.repopulate(store, change, key, report).await?;
        }
        Ok(())
    }

    async fn repopulate(
        &self,
        store: &dyn AuthoritativeStore,
        change: &Change,
        key: &str,
        report: &mut RunReport,
    ) -> ReconcileResult<()> {
        let record = match store.read(&change.id).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let value = CachedRecord::from(record).encode();
        if self.cache.set_if_absent(key, value, self.config.refresh_ttl()).await? {
            report.refreshed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use bilicore_cache::CacheConfig;
    use bilicore_coord::LockConfig;
    use bilicore_storage::{ManualClock, MemoryBackend};
    use bilicore_store::{EntityId, RelationalStore, Revision};
    use bytes::Bytes;

    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    struct Fixture {
        clock: ManualClock,
        cache: CacheStore<MemoryBackend>,
        store: RelationalStore,
        engine: ReconciliationEngine<MemoryBackend>,
    }

    fn fixture(refresh: RefreshPolicy) -> Fixture {
        let clock = ManualClock::starting_now();
        let backend = MemoryBackend::with_clock(clock.shared());
        let cache = CacheStore::new(backend.clone(), CacheConfig::default(), clock.shared());
        let coordinator = LockCoordinator::new(
            backend.clone(),
            LockConfig::builder().instance_id("test").build().unwrap(),
            clock.shared(),
        );
        let store = RelationalStore::new();
        let engine = ReconciliationEngine::new(
            ReconcileConfig::default(),
            coordinator,
            cache.clone(),
            backend,
            clock.shared(),
        )
        .with_store(Arc::new(store.clone()))
        .with_job(
            JobSpec::builder()
                .name("user-sync")
                .store(StoreKind::Relational)
                .refresh(refresh)
                .build()
                .unwrap(),
        )
        .unwrap();
        Fixture { clock, cache, store, engine }
    }

    async fn cache_record(f: &Fixture, id: &str) -> u64 {
        let record = f.store.read(&id.into()).await.unwrap();
        let key = cache_key(StoreKind::Relational, &record.id);
        f.cache.set(&key, CachedRecord::from(record).encode(), TTL).await.unwrap()
    }

    fn key(id: &str) -> String {
        cache_key(StoreKind::Relational, &EntityId::from(id))
    }

    #[tokio::test]
    async fn test_stale_entry_invalidated_current_entry_kept() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        f.store.write(&"u1".into(), Bytes::from("v1")).await.unwrap();
        f.store.write(&"u2".into(), Bytes::from("v1")).await.unwrap();
        cache_record(&f, "u1").await;
        cache_record(&f, "u2").await;
        f.store.write(&"u1".into(), Bytes::from("v2")).await.unwrap();

        let outcome = f.engine.run("user-sync").await;
        let report = outcome.report().expect("success");
        assert_eq!(report.scanned, 3);
        assert_eq!(report.invalidated, 1);
        assert_eq!(report.in_sync, 2);

        assert!(f.cache.get(&key("u1")).await.unwrap().is_none());
        assert!(f.cache.get(&key("u2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_advances_and_second_run_scans_nothing() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        f.store.write(&"u1".into(), Bytes::from("v1")).await.unwrap();

        assert_eq!(f.engine.run("user-sync").await.report().unwrap().scanned, 1);
        let checkpoint = f.engine.checkpoints().get("user-sync").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_cursor.unwrap().as_str(), "rel/1");

        let second = f.engine.run("user-sync").await;
        assert_eq!(second.report().unwrap().scanned, 0);
        assert_eq!(second.report().unwrap().new_cursor.as_ref().unwrap().as_str(), "rel/1");
    }

    #[tokio::test]
    async fn test_repopulate_writes_current_record() {
        let f = fixture(RefreshPolicy::Repopulate);
        f.store.write(&"u1".into(), Bytes::from("old")).await.unwrap();
        cache_record(&f, "u1").await;
        f.store.write(&"u1".into(), Bytes::from("new")).await.unwrap();

        let outcome = f.engine.run("user-sync").await;
        let report = outcome.report().unwrap();
        assert_eq!((report.invalidated, report.refreshed), (1, 1));

        let cached = CachedRecord::decode(&f.cache.get(&key("u1")).await.unwrap().unwrap()).unwrap();
        assert_eq!(cached.revision, Revision::new(2));
        assert_eq!(cached.payload, Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_newer_write_through_wins_over_stale_observation() {
        let f = fixture(RefreshPolicy::Repopulate);
        f.store.write(&"k1".into(), Bytes::from("v1")).await.unwrap();
        let v_old = f.cache.set(&key("k1"), Bytes::from("stale"), TTL).await.unwrap();
        let observed = f.cache.peek(&key("k1")).await.unwrap().unwrap();
        assert_eq!(observed.version, v_old);

        // A write-through lands between the peek and the invalidation.
        f.clock.advance(Duration::from_millis(1));
        let v_new = f.cache.set(&key("k1"), Bytes::from("fresh"), TTL).await.unwrap();
        assert!(v_new > v_old);

        let change = f.store.scan_changes_since(None).next().await.unwrap().unwrap();
        let spec = f.engine.jobs().next().unwrap().clone();
        let mut report = RunReport::default();
        f.engine
            .reconcile_entry(&spec, &f.store, &change, &key("k1"), observed, &mut report)
            .await
            .unwrap();

        assert_eq!(report.version_conflicts, 1);
        assert_eq!(report.refreshed, 0);
        let current = f.cache.peek(&key("k1")).await.unwrap().unwrap();
        assert_eq!((current.version, current.value), (v_new, Bytes::from("fresh")));
    }

    #[tokio::test]
    async fn test_unknown_job_fails() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        assert!(matches!(
            f.engine.run("nope").await,
            RunOutcome::Failed(ReconcileError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_job_requires_registered_store() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        let err = f
            .engine
            .with_job(JobSpec::builder().name("docs").store(StoreKind::Document).build().unwrap())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingStore(StoreKind::Document)));
    }

    #[tokio::test]
    async fn test_status_tracks_outcomes() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        f.engine.run("user-sync").await;
        let status = f.engine.status("user-sync").unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert!(status.last_success_at.is_some());
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_checkpoint_and_releases_lock() {
        let f = fixture(RefreshPolicy::InvalidateOnly);
        f.store.write(&"u1".into(), Bytes::from("v1")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f.engine.run_until("user-sync", &cancel).await;
        assert!(matches!(outcome, RunOutcome::Failed(ReconcileError::Cancelled { .. })));
        assert!(f.engine.checkpoints().get("user-sync").await.unwrap().is_none());

        // Lock was released, so the next run proceeds immediately.
        assert!(f.engine.run("user-sync").await.is_success());
    }
}
