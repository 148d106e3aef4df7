//! Periodic ticks for registered jobs.

use std::{sync::Arc, time::Duration};

use bilicore_storage::StorageBackend;
use tokio::{
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::engine::ReconciliationEngine;

/// Ticks jobs on their intervals until cancelled.
///
/// Each job gets its own task that awaits one run before taking the next
/// tick, so two runs of the same job never overlap inside an instance. Ticks
/// that fall due while a run is still going are skipped, not queued.
#[derive(Debug)]
pub struct Scheduler<B> {
    engine: Arc<ReconciliationEngine<B>>,
    jobs: Vec<(String, Duration)>,
    cancel: CancellationToken,
}

/// A running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl<B: StorageBackend + Clone + 'static> Scheduler<B> {
    /// Creates a scheduler ticking every job registered on `engine` at its
    /// configured interval.
    pub fn new(engine: Arc<ReconciliationEngine<B>>, cancel: CancellationToken) -> Self {
        let jobs = engine.jobs().map(|spec| (spec.name().to_owned(), spec.interval())).collect();
        Self { engine, jobs, cancel }
    }

    /// Overrides the interval of one job. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_interval(mut self, job: &str, every: Duration) -> Self {
        for (name, interval) in &mut self.jobs {
            if name == job {
                *interval = every.max(Duration::from_millis(1));
            }
        }
        self
    }

    /// Spawns one ticking task per job.
    ///
    /// The first tick of every job fires immediately.
    pub fn start(self) -> SchedulerHandle {
        let mut tasks = JoinSet::new();
        for (job, every) in self.jobs {
            let engine = Arc::clone(&self.engine);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tracing::info!(job = %job, every = ?every, "reconciliation job scheduled");
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            engine.run_until(&job, &cancel).await;
                        },
                    }
                }
                tracing::debug!(job = %job, "reconciliation job stopped");
            });
        }
        SchedulerHandle { cancel: self.cancel, tasks }
    }
}

impl SchedulerHandle {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops ticking and waits for in-flight runs to wind down.
    ///
    /// A run interrupted here fails with
    /// [`ReconcileError::Cancelled`](crate::ReconcileError::Cancelled) and
    /// leaves its checkpoint untouched.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "reconciliation task panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bilicore_cache::{CacheConfig, CacheStore};
    use bilicore_coord::{LockConfig, LockCoordinator};
    use bilicore_storage::MemoryBackend;
    use bilicore_store::{AuthoritativeStore, RelationalStore, StoreKind};
    use bytes::Bytes;

    use super::*;
    use crate::{JobSpec, ReconcileConfig};

    fn engine(store: &RelationalStore) -> Arc<ReconciliationEngine<MemoryBackend>> {
        let backend = MemoryBackend::new();
        let clock = bilicore_storage::system_clock();
        Arc::new(
            ReconciliationEngine::new(
                ReconcileConfig::default(),
                LockCoordinator::new(backend.clone(), LockConfig::default(), clock.clone()),
                CacheStore::new(backend.clone(), CacheConfig::default(), clock.clone()),
                backend,
                clock,
            )
            .with_store(Arc::new(store.clone()))
            .with_job(
                JobSpec::builder()
                    .name("user-sync")
                    .store(StoreKind::Relational)
                    .interval(Duration::from_secs(60))
                    .build()
                    .unwrap(),
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let store = RelationalStore::new();
        store.write(&"u1".into(), Bytes::from("x")).await.unwrap();
        let engine = engine(&store);

        let handle = Scheduler::new(Arc::clone(&engine), CancellationToken::new()).start();

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = engine.status("user-sync").unwrap().last_success_at.unwrap();
        assert_eq!(engine.status("user-sync").unwrap().last_report.unwrap().scanned, 1);

        store.write(&"u2".into(), Bytes::from("x")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = engine.status("user-sync").unwrap();
        assert_eq!(status.last_report.unwrap().scanned, 1, "second run resumes after u1");
        assert!(status.last_success_at.unwrap() >= first);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticking() {
        let store = RelationalStore::new();
        let engine = engine(&store);
        let handle = Scheduler::new(Arc::clone(&engine), CancellationToken::new())
            .with_interval("user-sync", Duration::from_secs(5))
            .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown().await;
        let attempted = engine.status("user-sync").unwrap().last_attempt_at;

        store.write(&"u1".into(), Bytes::from("x")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(engine.status("user-sync").unwrap().last_attempt_at, attempted);
    }
}
