//! Cross-instance behavior of `CacheStore`.
//!
//! Two `CacheStore` values over one `MemoryBackend` model two service
//! instances sharing the same cache cluster.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;

use bilicore_cache::{CacheConfig, CacheStore};
use bilicore_storage::{Clock, ManualClock, MemoryBackend, StorageBackend};
use bytes::Bytes;
use proptest::prelude::*;

const TTL: Duration = Duration::from_secs(300);

fn two_instances() -> (ManualClock, CacheStore<MemoryBackend>, CacheStore<MemoryBackend>) {
    let clock = ManualClock::starting_now();
    let backend = MemoryBackend::with_clock(clock.shared());
    let a = CacheStore::new(backend.clone(), CacheConfig::default(), clock.shared());
    let b = CacheStore::new(backend, CacheConfig::default(), clock.shared());
    (clock, a, b)
}

// ============================================================================
// Version conflict scenario
// ============================================================================

/// Entry "k1" sits at version 3; a reconciliation pass that observed version 2
/// must not invalidate it.
#[tokio::test]
async fn stale_observed_version_leaves_newer_entry_untouched() {
    let clock = ManualClock::starting_now();
    let backend = MemoryBackend::with_clock(clock.shared());
    let cache = CacheStore::new(backend.clone(), CacheConfig::default(), clock.shared());

    let expires_at = (clock.now() + chrono::Duration::minutes(5)).to_rfc3339();
    let envelope = format!(r#"{{"value":"djM=","version":3,"expires_at":"{expires_at}"}}"#);
    backend.set(b"Cache:k1".to_vec(), envelope.into_bytes()).await.expect("seed");

    assert!(!cache.compare_and_invalidate("k1", 2).await.expect("cai"));

    let entry = cache.peek("k1").await.expect("peek").expect("entry remains");
    assert_eq!(entry.version, 3);
    assert_eq!(entry.value, Bytes::from("v3"));
}

// ============================================================================
// Cross-instance visibility
// ============================================================================

#[tokio::test]
async fn invalidation_on_one_instance_is_visible_on_the_other() {
    let (_clock, a, b) = two_instances();

    a.set("video::1", Bytes::from("v1"), TTL).await.expect("set");
    assert_eq!(b.get("video::1").await.expect("get"), Some(Bytes::from("v1")));

    b.invalidate("video::1").await.expect("invalidate");
    assert_eq!(a.get("video::1").await.expect("get"), None);
}

#[tokio::test]
async fn writers_on_two_instances_get_distinct_versions() {
    let (_clock, a, b) = two_instances();

    let mut versions = Vec::new();
    for i in 0..10 {
        let store = if i % 2 == 0 { &a } else { &b };
        versions.push(store.set("k", Bytes::from(format!("v{i}")), TTL).await.expect("set"));
    }

    let mut sorted = versions.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted, versions, "versions strictly increase across instances");
}

#[tokio::test]
async fn remote_invalidation_during_load_prevents_stale_populate() {
    let (_clock, a, b) = two_instances();
    a.set("user::7", Bytes::from("old"), TTL).await.expect("seed");
    a.invalidate("user::7").await.expect("make it a miss");

    let loaded = a
        .get_or_load("user::7", TTL, || async {
            b.invalidate("user::7").await.expect("remote invalidate");
            Ok::<_, std::io::Error>(Bytes::from("old"))
        })
        .await
        .expect("load");

    assert_eq!(loaded, Bytes::from("old"));
    assert_eq!(b.get("user::7").await.expect("get"), None);
}

#[tokio::test]
async fn entries_expire_by_their_own_deadline() {
    let (clock, a, b) = two_instances();
    a.set("k", Bytes::from("v"), Duration::from_secs(60)).await.expect("set");

    clock.advance(Duration::from_secs(59));
    assert!(b.get("k").await.expect("get").is_some());
    clock.advance(Duration::from_secs(1));
    assert!(b.get("k").await.expect("get").is_none());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Repeating compare-and-invalidate with any version other than the
    /// current one never changes the entry.
    #[test]
    fn compare_and_invalidate_with_wrong_version_is_idempotent_noop(
        writes in 1usize..6,
        offsets in proptest::collection::vec(1u64..1_000, 1..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
        rt.block_on(async {
            let (_clock, cache, _) = two_instances();
            let mut current = 0;
            for i in 0..writes {
                current = cache.set("k", Bytes::from(format!("v{i}")), TTL).await.expect("set");
            }

            for offset in &offsets {
                let wrong = current.wrapping_sub(*offset);
                prop_assert!(!cache.compare_and_invalidate("k", wrong).await.expect("cai"));
                let entry = cache.peek("k").await.expect("peek").expect("still present");
                prop_assert_eq!(entry.version, current);
            }

            prop_assert!(cache.compare_and_invalidate("k", current).await.expect("cai"));
            prop_assert!(!cache.compare_and_invalidate("k", current).await.expect("cai"));
            Ok(())
        })?;
    }
}
