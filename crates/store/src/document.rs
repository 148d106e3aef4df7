//! Document collection on top of a shared key-value backend.
//!
//! Layout, for collection `c`:
//!
//! | Key | Value |
//! |-----|-------|
//! | `doc:{c}:{id}` | `{"revision":n,"payload":"<base64>"}` |
//! | `feed:{c}:{seq:020}` | `{"id":"..","revision":n}` |
//! | `feed:{c}:head` | highest sequence number known to be written |
//!
//! Documents are replaced with compare-and-set, so concurrent writers to one
//! document get distinct revisions. Feed slots are claimed with
//! create-if-absent starting just above the head hint; since the hint never
//! runs ahead of the written entries, the feed has no gaps.
//!
//! The head hint is bumped after the slot is written. A scan stops at the
//! hint it saw at start, so a change whose hint bump is still in flight is
//! picked up by the next scan.

use std::fmt;

use async_trait::async_trait;
use bilicore_storage::{ConfigError, StorageBackend, StorageError};
use bytes::Bytes;
use fail::fail_point;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};

use crate::{
    authoritative::{AuthoritativeStore, DEFAULT_SCAN_PAGE_SIZE},
    error::{StoreError, StoreResult},
    scan::{Page, ScanState, changes},
    types::{AuthoritativeRecord, Change, Cursor, EntityId, Revision, StoreKind},
};

/// Compare-and-set attempts before a write reports contention.
const MAX_CAS_ATTEMPTS: u32 = 16;

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    revision: Revision,
    #[serde(with = "crate::b64")]
    payload: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct FeedEntry {
    id: EntityId,
    revision: Revision,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::corrupt("document", e.to_string()))
}

/// A document collection.
///
/// Clones share the backend.
#[derive(Clone)]
pub struct DocumentStore<B> {
    backend: B,
    collection: String,
    page_size: usize,
    cursor_tag: String,
}

impl<B> fmt::Debug for DocumentStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("collection", &self.collection)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl<B: StorageBackend> DocumentStore<B> {
    /// Creates a store for `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the collection name is empty or contains
    /// `:`, or the page size is zero.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(into)] collection: String,
        #[builder(default = DEFAULT_SCAN_PAGE_SIZE)] page_size: usize,
    ) -> Result<Self, ConfigError> {
        if collection.is_empty() || collection.contains(':') {
            return Err(ConfigError::invalid("collection", "must be non-empty and free of ':'"));
        }
        if page_size == 0 {
            return Err(ConfigError::MustBePositive { field: "page_size", value: "0".into() });
        }
        let cursor_tag = format!("doc:{collection}");
        Ok(Self { backend, collection, page_size, cursor_tag })
    }

    /// Collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn doc_key(&self, id: &EntityId) -> Vec<u8> {
        format!("doc:{}:{id}", self.collection).into_bytes()
    }

    fn feed_key(&self, seq: u64) -> Vec<u8> {
        format!("feed:{}:{seq:020}", self.collection).into_bytes()
    }

    fn head_key(&self) -> Vec<u8> {
        format!("feed:{}:head", self.collection).into_bytes()
    }

    async fn head(&self) -> StoreResult<(u64, Option<Bytes>)> {
        match self.backend.get(&self.head_key()).await? {
            None => Ok((0, None)),
            Some(raw) => {
                let head = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StoreError::corrupt("feed head", "not a sequence number"))?;
                Ok((head, Some(raw)))
            },
        }
    }

    /// Replaces the document and returns its new revision.
    async fn replace(&self, id: &EntityId, payload: &Bytes) -> StoreResult<Revision> {
        let key = self.doc_key(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.backend.get(&key).await?;
            let revision = match &current {
                None => Revision::new(1),
                Some(raw) => serde_json::from_slice::<StoredDocument>(raw)
                    .map_err(|e| StoreError::corrupt(format!("document {id}"), e.to_string()))?
                    .revision
                    .next(),
            };
            let doc = encode(&StoredDocument { revision, payload: payload.clone() })?;

            match self.backend.compare_and_set(&key, current.as_deref(), doc).await {
                Ok(()) => return Ok(revision),
                Err(StorageError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Contention { id: id.clone(), attempts: MAX_CAS_ATTEMPTS })
    }

    /// Appends a feed entry in the first free slot above the head hint.
    async fn append_feed(&self, entry: &FeedEntry) -> StoreResult<u64> {
        let bytes = encode(entry)?;
        let (mut seq, _) = self.head().await?;
        loop {
            seq += 1;
            match self.backend.compare_and_set(&self.feed_key(seq), None, bytes.clone()).await {
                Ok(()) => break,
                Err(StorageError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        // Raise the hint to at least `seq`; a concurrent appender may already
        // have raised it further.
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (head, raw) = self.head().await?;
            if head >= seq {
                break;
            }
            match self
                .backend
                .compare_and_set(&self.head_key(), raw.as_deref(), seq.to_string().into_bytes())
                .await
            {
                Ok(()) => break,
                Err(StorageError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(seq)
    }

    async fn page(&self, after: u64, head: u64) -> StoreResult<Page> {
        fail_point!("store-scan-page", |_| Err(StoreError::unavailable("injected scan failure")));

        let scanned_to = head.min(after.saturating_add(self.page_size as u64));
        let entries = self.backend.get_range(self.feed_key(after + 1)..self.feed_key(scanned_to + 1)).await?;

        let mut changes = Vec::with_capacity(entries.len());
        for kv in entries {
            let seq = std::str::from_utf8(&kv.key)
                .ok()
                .and_then(|k| k.rsplit(':').next())
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| StoreError::corrupt("feed key", String::from_utf8_lossy(&kv.key)))?;
            let entry: FeedEntry = serde_json::from_slice(&kv.value)
                .map_err(|e| StoreError::corrupt(format!("feed entry {seq}"), e.to_string()))?;
            changes.push(Change {
                id: entry.id,
                revision: entry.revision,
                cursor: Cursor::at(&self.cursor_tag, seq),
            });
        }
        Ok(Page { changes, scanned_to })
    }
}

#[async_trait]
impl<B: StorageBackend> AuthoritativeStore for DocumentStore<B> {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    #[tracing::instrument(skip(self), fields(kind = "document", collection = %self.collection))]
    async fn read(&self, id: &EntityId) -> StoreResult<AuthoritativeRecord> {
        fail_point!("store-read", |_| Err(StoreError::unavailable("injected read failure")));

        let raw = self
            .backend
            .get(&self.doc_key(id))
            .await?
            .ok_or_else(|| StoreError::not_found(StoreKind::Document, id.clone()))?;
        let doc: StoredDocument = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::corrupt(format!("document {id}"), e.to_string()))?;
        Ok(AuthoritativeRecord {
            kind: StoreKind::Document,
            id: id.clone(),
            revision: doc.revision,
            payload: doc.payload,
        })
    }

    #[tracing::instrument(skip(self, payload), fields(kind = "document", collection = %self.collection))]
    async fn write(&self, id: &EntityId, payload: Bytes) -> StoreResult<Revision> {
        fail_point!("store-before-write", |_| Err(StoreError::unavailable("injected write failure")));

        let revision = self.replace(id, &payload).await?;
        // The document is committed at this point. A failed append only
        // delays reconciliation of this change until the entry's TTL.
        match self.append_feed(&FeedEntry { id: id.clone(), revision }).await {
            Ok(seq) => tracing::debug!(%revision, seq, "document committed"),
            Err(err) => tracing::warn!(
                target: "bilicore::consistency",
                %revision,
                error = %err,
                "document committed without change feed entry"
            ),
        }
        Ok(revision)
    }

    fn scan_changes_since(&self, cursor: Option<&Cursor>) -> BoxStream<'_, StoreResult<Change>> {
        let after = match cursor.map(|c| c.seq(&self.cursor_tag)).transpose() {
            Ok(after) => after.unwrap_or(0),
            Err(err) => return futures::stream::once(async move { Err(err) }).boxed(),
        };

        futures::stream::once(self.head())
            .flat_map(move |head| match head {
                Ok((head, _)) => changes(ScanState::new(after, head), move |after, head| self.page(after, head)),
                Err(err) => futures::stream::once(async move { Err(err) }).boxed(),
            })
            .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use bilicore_storage::{MemoryBackend, testutil::FlakyBackend};
    use futures::TryStreamExt;

    use super::*;

    fn store<B: StorageBackend>(backend: B, page_size: usize) -> DocumentStore<B> {
        DocumentStore::builder().backend(backend).collection("video").page_size(page_size).build().unwrap()
    }

    #[tokio::test]
    async fn test_layout_keys() {
        let backend = MemoryBackend::new();
        let docs = store(backend.clone(), 10);
        docs.write(&"v1".into(), Bytes::from("{}")).await.unwrap();

        assert!(backend.get(b"doc:video:v1").await.unwrap().is_some());
        assert!(backend.get(b"feed:video:00000000000000000001").await.unwrap().is_some());
        assert_eq!(backend.get(b"feed:video:head").await.unwrap().unwrap().as_ref(), b"1");
    }

    #[tokio::test]
    async fn test_write_read_round_trip_with_revisions() {
        let docs = store(MemoryBackend::new(), 10);
        let id = EntityId::from("v1");

        assert_eq!(docs.write(&id, Bytes::from("a")).await.unwrap(), Revision::new(1));
        assert_eq!(docs.write(&id, Bytes::from("b")).await.unwrap(), Revision::new(2));
        let record = docs.read(&id).await.unwrap();
        assert_eq!((record.revision, record.payload), (Revision::new(2), Bytes::from("b")));
        assert!(docs.read(&"v2".into()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_scan_pages_and_resumes() {
        let docs = store(MemoryBackend::new(), 3);
        for i in 0..7 {
            docs.write(&format!("v{i}").into(), Bytes::from("x")).await.unwrap();
        }

        let all: Vec<Change> = docs.scan_changes_since(None).try_collect().await.unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[6].cursor.as_str(), "doc:video/7");

        let rest: Vec<Change> = docs.scan_changes_since(Some(&all[4].cursor)).try_collect().await.unwrap();
        assert_eq!(rest, all[5..].to_vec());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let backend = MemoryBackend::new();
        let videos = store(backend.clone(), 10);
        let articles =
            DocumentStore::builder().backend(backend).collection("article").build().unwrap();

        videos.write(&"x".into(), Bytes::from("v")).await.unwrap();
        assert!(articles.read(&"x".into()).await.unwrap_err().is_not_found());
        assert_eq!(articles.scan_changes_since(None).count().await, 0);

        let foreign = Cursor::from_raw("doc:video/1");
        let err = articles.scan_changes_since(Some(&foreign)).try_collect::<Vec<_>>().await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_get_distinct_revisions_and_slots() {
        let docs = store(MemoryBackend::new(), 100);
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let docs = docs.clone();
            set.spawn(async move { docs.write(&"hot".into(), Bytes::from("x")).await });
        }
        let mut revisions = Vec::new();
        while let Some(joined) = set.join_next().await {
            revisions.push(joined.expect("task").expect("write").get());
        }
        revisions.sort_unstable();
        assert_eq!(revisions, (1..=8).collect::<Vec<_>>());

        let feed: Vec<Change> = docs.scan_changes_since(None).try_collect().await.unwrap();
        assert_eq!(feed.len(), 8);
    }

    #[tokio::test]
    async fn test_backend_outage_is_retryable() {
        let backend = FlakyBackend::new(MemoryBackend::new());
        let docs = store(backend.clone(), 10);
        backend.set_reads_unavailable(true);

        assert!(docs.read(&"v1".into()).await.unwrap_err().is_retryable());
        let err = docs.scan_changes_since(None).try_collect::<Vec<_>>().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_collection() {
        let err = DocumentStore::builder().backend(MemoryBackend::new()).collection("a:b").build();
        assert!(err.is_err());
    }
}
