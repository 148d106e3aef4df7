//! Change scan behaviour common to every `AuthoritativeStore`.
//!
//! Each test runs against both implementations through `Arc<dyn ..>`, the
//! way the gateway and the reconciliation engine hold them.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{collections::BTreeMap, sync::Arc};

use bilicore_storage::MemoryBackend;
use bilicore_store::{
    AuthoritativeStore, Change, Cursor, DocumentStore, EntityId, RelationalStore, Revision, StoreError,
    testutil::FlakyStore,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use proptest::prelude::*;

fn stores(page_size: usize) -> Vec<Arc<dyn AuthoritativeStore>> {
    vec![
        Arc::new(RelationalStore::with_page_size(page_size)),
        Arc::new(
            DocumentStore::builder()
                .backend(MemoryBackend::new())
                .collection("video")
                .page_size(page_size)
                .build()
                .expect("valid store"),
        ),
    ]
}

async fn scan_all(store: &dyn AuthoritativeStore, cursor: Option<&Cursor>) -> Vec<Change> {
    store.scan_changes_since(cursor).try_collect().await.expect("scan")
}

// ============================================================================
// Contract
// ============================================================================

#[tokio::test]
async fn scan_reports_every_write_in_commit_order() {
    for store in stores(4) {
        let ids = ["a", "b", "a", "c", "a"];
        let mut expected = Vec::new();
        for id in ids {
            let revision = store.write(&id.into(), Bytes::from(id)).await.unwrap();
            expected.push((EntityId::from(id), revision));
        }

        let seen: Vec<_> = scan_all(store.as_ref(), None).await.into_iter().map(|c| (c.id, c.revision)).collect();
        assert_eq!(seen, expected, "{:?}", store.kind());
        assert_eq!(expected[4].1, Revision::new(3));
    }
}

#[tokio::test]
async fn empty_store_scans_empty() {
    for store in stores(4) {
        assert!(scan_all(store.as_ref(), None).await.is_empty());
    }
}

#[tokio::test]
async fn scan_is_lazy_per_page() {
    for store in stores(2) {
        for i in 0..6 {
            store.write(&format!("e{i}").into(), Bytes::from("x")).await.unwrap();
        }
        let first_two: Vec<_> = store.scan_changes_since(None).take(2).try_collect().await.unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[1].id.as_str(), "e1");
    }
}

#[tokio::test]
async fn cursor_from_checkpoint_string_resumes() {
    for store in stores(3) {
        for i in 0..5 {
            store.write(&format!("e{i}").into(), Bytes::from("x")).await.unwrap();
        }
        let all = scan_all(store.as_ref(), None).await;

        // Round-trip through the raw form a checkpoint persists.
        let persisted = Cursor::from_raw(all[1].cursor.as_str().to_owned());
        let rest = scan_all(store.as_ref(), Some(&persisted)).await;
        assert_eq!(rest, all[2..].to_vec());
    }
}

// ============================================================================
// Failure mid-scan
// ============================================================================

#[tokio::test]
async fn mid_scan_failure_is_resumable_from_last_cursor() {
    for inner in stores(2) {
        for i in 0..5 {
            inner.write(&format!("e{i}").into(), Bytes::from("x")).await.unwrap();
        }
        let flaky = FlakyStore::new(Arc::clone(&inner));
        flaky.fail_scans_after(Some(3));

        let results: Vec<_> = flaky.scan_changes_since(None).collect().await;
        assert_eq!(results.len(), 4);
        assert!(matches!(results[3], Err(StoreError::Unavailable { .. })));
        let last_ok = results[2].as_ref().unwrap().cursor.clone();

        flaky.fail_scans_after(None);
        let rest = scan_all(&flaky, Some(&last_ok)).await;
        let ids: Vec<_> = rest.iter().map(|c| c.id.as_str().to_owned()).collect();
        assert_eq!(ids, ["e3", "e4"]);
    }
}

// ============================================================================
// Property: resuming anywhere sees exactly the suffix
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn resume_yields_exact_suffix(
        writes in prop::collection::vec(0..4u8, 1..30),
        page_size in 1..8usize,
        split in any::<prop::sample::Index>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            for store in stores(page_size) {
                let mut latest = BTreeMap::new();
                for w in &writes {
                    let id = EntityId::from(format!("e{w}"));
                    let revision = store.write(&id, Bytes::from("x")).await.unwrap();
                    latest.insert(id, revision);
                }

                let all = scan_all(store.as_ref(), None).await;
                assert_eq!(all.len(), writes.len());

                let at = split.index(all.len());
                let rest = scan_all(store.as_ref(), Some(&all[at].cursor)).await;
                assert_eq!(rest, all[at + 1..].to_vec());

                // The last change per entity carries its current revision.
                let mut last = BTreeMap::new();
                for change in &all {
                    last.insert(change.id.clone(), change.revision);
                }
                assert_eq!(last, latest);
            }
        });
    }
}
