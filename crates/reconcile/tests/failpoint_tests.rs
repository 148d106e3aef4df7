#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Crash injection inside a reconciliation run.
//!
//! Requires the `failpoints` feature:
//! ```bash
//! cargo test -p bilicore-reconcile --features failpoints --test failpoint_tests
//! ```

use std::{sync::Arc, time::Duration};

use bilicore_cache::{CacheConfig, CacheStore};
use bilicore_coord::{LockConfig, LockCoordinator};
use bilicore_reconcile::{
    JobSpec, ReconcileConfig, ReconcileError, ReconciliationEngine, RefreshPolicy, RunOutcome,
};
use bilicore_storage::{ManualClock, MemoryBackend};
use bilicore_store::{AuthoritativeStore, CachedRecord, EntityId, RelationalStore, StoreKind, cache_key};
use bytes::Bytes;

const JOB: &str = "user-sync";

struct Fixture {
    cache: CacheStore<MemoryBackend>,
    store: RelationalStore,
    engine: ReconciliationEngine<MemoryBackend>,
}

async fn fixture() -> Fixture {
    let clock = ManualClock::starting_now();
    let backend = MemoryBackend::with_clock(clock.shared());
    let cache = CacheStore::new(backend.clone(), CacheConfig::default(), clock.shared());
    let store = RelationalStore::new();
    let engine = ReconciliationEngine::new(
        ReconcileConfig::default(),
        LockCoordinator::new(backend.clone(), LockConfig::default(), clock.shared()),
        cache.clone(),
        backend,
        clock.shared(),
    )
    .with_store(Arc::new(store.clone()))
    .with_job(
        JobSpec::builder()
            .name(JOB)
            .store(StoreKind::Relational)
            .refresh(RefreshPolicy::InvalidateOnly)
            .build()
            .unwrap(),
    )
    .unwrap();

    for id in ["u1", "u2", "u3"] {
        store.write(&id.into(), Bytes::from("v1")).await.unwrap();
        let record = store.read(&id.into()).await.unwrap();
        let key = cache_key(StoreKind::Relational, &record.id);
        cache.set(&key, CachedRecord::from(record).encode(), Duration::from_secs(600)).await.unwrap();
        store.write(&id.into(), Bytes::from("v2")).await.unwrap();
    }
    Fixture { cache, store, engine }
}

async fn cached(f: &Fixture, id: &str) -> Option<Bytes> {
    f.cache.get(&cache_key(StoreKind::Relational, &EntityId::from(id))).await.unwrap()
}

#[tokio::test]
async fn crash_after_first_change_leaves_checkpoint() {
    let scenario = fail::FailScenario::setup();
    let f = fixture().await;

    fail::cfg("reconcile-after-change", "return").expect("configure fail point");
    let outcome = f.engine.run(JOB).await;
    assert!(matches!(outcome, RunOutcome::Failed(ReconcileError::Injected("reconcile-after-change"))));
    fail::remove("reconcile-after-change");

    assert!(f.engine.checkpoints().get(JOB).await.unwrap().is_none());
    // u1 rev 1 is current against its first change; nothing else was touched.
    assert!(cached(&f, "u1").await.is_some());
    assert!(cached(&f, "u3").await.is_some());

    let rerun = f.engine.run(JOB).await;
    let report = rerun.report().expect("rerun succeeds");
    assert_eq!(report.scanned, 6);
    assert_eq!(report.invalidated, 3);
    for id in ["u1", "u2", "u3"] {
        assert!(cached(&f, id).await.is_none(), "{id} still cached");
    }

    scenario.teardown();
}

#[tokio::test]
async fn crash_before_checkpoint_rerun_is_idempotent() {
    let scenario = fail::FailScenario::setup();
    let f = fixture().await;

    fail::cfg("reconcile-before-checkpoint", "return").expect("configure fail point");
    let outcome = f.engine.run(JOB).await;
    assert!(outcome.error().is_some());
    fail::remove("reconcile-before-checkpoint");

    // Every stale entry is gone, but the cursor did not move.
    for id in ["u1", "u2", "u3"] {
        assert!(cached(&f, id).await.is_none());
    }
    assert!(f.engine.checkpoints().get(JOB).await.unwrap().is_none());

    let rerun = f.engine.run(JOB).await;
    let report = rerun.report().expect("rerun succeeds");
    assert_eq!((report.scanned, report.invalidated, report.in_sync), (6, 0, 6));
    assert_eq!(
        f.engine.checkpoints().get(JOB).await.unwrap().unwrap().last_cursor.unwrap().as_str(),
        "rel/6"
    );
    assert_eq!(f.store.len(), 3);

    scenario.teardown();
}
