//! Concurrent access stress tests for `MemoryBackend`.
//!
//! These exercise the conditional primitives that locks and cache
//! invalidation rely on, under a multi-threaded runtime, to detect lost
//! updates and double winners.
//!
//! ```bash
//! cargo test -p bilicore-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::HashSet, time::Duration};

use bilicore_storage::{ManualClock, MemoryBackend, StorageBackend, StorageError};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of contention rounds.
const ROUNDS: usize = 50;

const LEASE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Lease acquisition: exactly one winner per round
// ---------------------------------------------------------------------------

/// `CONCURRENCY` tasks race to create the same leased key. Exactly one wins;
/// every other attempt observes `Conflict`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn lease_acquire_exactly_one_winner_per_round() {
    let backend = MemoryBackend::new();

    for round in 0..ROUNDS {
        let key = format!("lock:round-{round}").into_bytes();

        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let holder = format!("instance-{task_id}").into_bytes();
            set.spawn(async move {
                backend.compare_and_set_with_ttl(&key, None, holder, LEASE).await.map(|()| task_id)
            });
        }

        let mut winners = Vec::new();
        let mut conflicts = 0usize;
        while let Some(result) = set.join_next().await {
            match result.expect("task should not panic") {
                Ok(task_id) => winners.push(task_id),
                Err(StorageError::Conflict) => conflicts += 1,
                Err(e) => panic!("unexpected error in round {round}: {e}"),
            }
        }

        assert_eq!(winners.len(), 1, "round {round}: exactly one acquire should win");
        assert_eq!(conflicts, CONCURRENCY - 1);

        let stored = backend.get(&key).await.expect("get").expect("lease present");
        assert_eq!(stored.as_ref(), format!("instance-{}", winners[0]).as_bytes());
    }
}

/// Once a lease expires, a new race again produces exactly one winner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn expired_lease_reacquired_by_exactly_one() {
    let clock = ManualClock::starting_now();
    let backend = MemoryBackend::with_clock(clock.shared());
    let key = b"lock:reconcile".to_vec();

    backend
        .compare_and_set_with_ttl(&key, None, b"crashed".to_vec(), LEASE)
        .await
        .expect("first acquire");

    for round in 0..ROUNDS {
        clock.advance(LEASE);

        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let holder = format!("r{round}-t{task_id}").into_bytes();
            set.spawn(async move { backend.compare_and_set_with_ttl(&key, None, holder, LEASE).await });
        }

        let mut successes = 0usize;
        while let Some(result) = set.join_next().await {
            if result.expect("task should not panic").is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1, "round {round}: exactly one takeover");
    }
}

// ---------------------------------------------------------------------------
// Versioned CAS: no lost updates
// ---------------------------------------------------------------------------

/// Each task increments a shared counter with read-then-CAS, retrying on
/// conflict. The final value must equal the total number of increments.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn cas_counter_has_no_lost_updates() {
    const INCREMENTS: usize = 25;

    let backend = MemoryBackend::new();
    backend.set(b"counter".to_vec(), b"0".to_vec()).await.expect("seed");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            for _ in 0..INCREMENTS {
                loop {
                    let current = backend.get(b"counter").await.expect("get").expect("present");
                    let n: usize = std::str::from_utf8(&current)
                        .expect("utf8")
                        .parse()
                        .expect("number");
                    let next = (n + 1).to_string().into_bytes();
                    match backend.compare_and_set(b"counter", Some(&current), next).await {
                        Ok(()) => break,
                        Err(StorageError::Conflict) => {},
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let value = backend.get(b"counter").await.expect("get").expect("present");
    assert_eq!(value.as_ref(), (CONCURRENCY * INCREMENTS).to_string().as_bytes());
}

// ---------------------------------------------------------------------------
// Conditional delete vs concurrent rewrite
// ---------------------------------------------------------------------------

/// A writer keeps replacing a key while deleters try to remove a specific
/// older value. A conditional delete may only ever remove the exact bytes it
/// names, so every successful delete must have targeted the value present at
/// that moment and no delete may remove a value it did not name.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn compare_and_delete_never_removes_newer_value() {
    let backend = MemoryBackend::new();

    for round in 0..ROUNDS {
        let key = format!("cache:{round}").into_bytes();
        let stale = format!("v{round}-old").into_bytes();
        let fresh = format!("v{round}-new").into_bytes();
        backend.set(key.clone(), stale.clone()).await.expect("seed");

        let writer = {
            let backend = backend.clone();
            let key = key.clone();
            let stale = stale.clone();
            let fresh = fresh.clone();
            tokio::spawn(async move {
                backend.compare_and_set(&key, Some(&stale), fresh).await.is_ok()
            })
        };

        let mut set = JoinSet::new();
        for _ in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let stale = stale.clone();
            set.spawn(async move { backend.compare_and_delete(&key, &stale).await.is_ok() });
        }

        let mut deletes = 0usize;
        while let Some(result) = set.join_next().await {
            if result.expect("task should not panic") {
                deletes += 1;
            }
        }
        let rewrote = writer.await.expect("writer should not panic");

        assert!(deletes <= 1, "round {round}: the stale value can be deleted at most once");
        assert!(rewrote ^ (deletes == 1), "round {round}: exactly one of rewrite or delete wins");

        let remaining = backend.get(&key).await.expect("get");
        if rewrote {
            assert_eq!(remaining.as_deref(), Some(fresh.as_slice()));
        } else {
            assert_eq!(remaining, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Disjoint writers: no cross-talk
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn disjoint_prefix_writers_are_isolated() {
    const KEYS_PER_TASK: usize = 100;

    let backend = MemoryBackend::new();

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            for i in 0..KEYS_PER_TASK {
                let key = format!("t{task_id:02}:{i:06}").into_bytes();
                backend.set(key, task_id.to_string().into_bytes()).await.expect("set");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    for task_id in 0..CONCURRENCY {
        let start = format!("t{task_id:02}:").into_bytes();
        let end = format!("t{task_id:02};").into_bytes();
        let entries = backend.get_range(start..end).await.expect("get_range");
        assert_eq!(entries.len(), KEYS_PER_TASK);

        let owners: HashSet<_> = entries.iter().map(|kv| kv.value.clone()).collect();
        assert_eq!(owners.len(), 1, "task {task_id} range holds only its own values");
    }
}
