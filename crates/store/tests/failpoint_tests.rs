#![allow(clippy::expect_used, clippy::panic)]
//! Fail-point injection for the authoritative stores.
//!
//! Requires the `failpoints` feature:
//! ```bash
//! cargo test -p bilicore-store --features failpoints --test failpoint_tests
//! ```

use bilicore_store::{AuthoritativeStore, EntityId, RelationalStore, StoreError};
use bytes::Bytes;
use futures::StreamExt;

#[tokio::test]
async fn scan_page_failpoint_ends_scan_with_retryable_error() {
    let scenario = fail::FailScenario::setup();
    let store = RelationalStore::with_page_size(2);
    for i in 0..4 {
        store.write(&EntityId::from(format!("e{i}")), Bytes::from("x")).await.expect("write");
    }

    // First page succeeds, the second is injected to fail.
    fail::cfg("store-scan-page", "1*off->return").expect("configure fail point");
    let results: Vec<_> = store.scan_changes_since(None).collect().await;

    assert_eq!(results.len(), 3);
    match &results[2] {
        Err(err) => assert!(err.is_retryable()),
        Ok(change) => panic!("expected failure, got {change:?}"),
    }

    scenario.teardown();
}

#[tokio::test]
async fn write_failpoint_commits_nothing() {
    let scenario = fail::FailScenario::setup();
    let store = RelationalStore::new();

    fail::cfg("store-before-write", "return").expect("configure fail point");
    let err = store.write(&"e1".into(), Bytes::from("x")).await.expect_err("injected");
    assert!(matches!(err, StoreError::Unavailable { .. }));
    fail::remove("store-before-write");

    assert!(store.read(&"e1".into()).await.expect_err("nothing committed").is_not_found());
    assert!(store.is_empty());

    scenario.teardown();
}
