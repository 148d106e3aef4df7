//! In-process relational store.
//!
//! Rows carry their own revision; every committed write also appends to an
//! ordered change log, which is what [`scan_changes_since`] pages through.
//!
//! [`scan_changes_since`]: AuthoritativeStore::scan_changes_since

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;

use crate::{
    authoritative::{AuthoritativeStore, DEFAULT_SCAN_PAGE_SIZE},
    error::{StoreError, StoreResult},
    scan::{Page, ScanState, changes},
    types::{AuthoritativeRecord, Change, Cursor, EntityId, Revision, StoreKind},
};

const CURSOR_TAG: &str = "rel";

#[derive(Debug)]
struct Row {
    revision: Revision,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<EntityId, Row>,
    /// Change log; entry `n` has sequence number `n + 1`.
    log: Vec<(EntityId, Revision)>,
}

/// A relational table kept in process memory.
///
/// Clones share the same table.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    tables: Arc<RwLock<Tables>>,
    page_size: usize,
}

impl Default for RelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_SCAN_PAGE_SIZE)
    }

    /// Creates an empty store whose scans fetch `page_size` changes at a time.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self { tables: Arc::new(RwLock::new(Tables::default())), page_size: page_size.max(1) }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().rows.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn page(&self, after: u64, head: u64) -> StoreResult<Page> {
        fail_point!("store-scan-page", |_| Err(StoreError::unavailable("injected scan failure")));

        let tables = self.tables.read();
        let start = usize::try_from(after).unwrap_or(usize::MAX);
        let end = usize::try_from(head).unwrap_or(usize::MAX).min(start.saturating_add(self.page_size));
        let changes: Vec<Change> = tables
            .log
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .zip(after + 1..)
            .map(|((id, revision), seq)| Change {
                id: id.clone(),
                revision: *revision,
                cursor: Cursor::at(CURSOR_TAG, seq),
            })
            .collect();
        Ok(Page { scanned_to: after + changes.len() as u64, changes })
    }
}

#[async_trait]
impl AuthoritativeStore for RelationalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    #[tracing::instrument(skip(self), fields(kind = "relational"))]
    async fn read(&self, id: &EntityId) -> StoreResult<AuthoritativeRecord> {
        let tables = self.tables.read();
        let row = tables.rows.get(id).ok_or_else(|| StoreError::not_found(StoreKind::Relational, id.clone()))?;
        Ok(AuthoritativeRecord {
            kind: StoreKind::Relational,
            id: id.clone(),
            revision: row.revision,
            payload: row.payload.clone(),
        })
    }

    #[tracing::instrument(skip(self, payload), fields(kind = "relational"))]
    async fn write(&self, id: &EntityId, payload: Bytes) -> StoreResult<Revision> {
        fail_point!("store-before-write", |_| Err(StoreError::unavailable("injected write failure")));

        let mut tables = self.tables.write();
        let revision = tables.rows.get(id).map_or(Revision::new(1), |row| row.revision.next());
        tables.rows.insert(id.clone(), Row { revision, payload });
        tables.log.push((id.clone(), revision));
        tracing::debug!(%revision, "row committed");
        Ok(revision)
    }

    fn scan_changes_since(&self, cursor: Option<&Cursor>) -> BoxStream<'_, StoreResult<Change>> {
        let after = match cursor.map(|c| c.seq(CURSOR_TAG)).transpose() {
            Ok(after) => after.unwrap_or(0),
            Err(err) => return futures::stream::once(async move { Err(err) }).boxed(),
        };
        let head = self.tables.read().log.len() as u64;

        changes(ScanState::new(after, head), move |after, head| {
            let page = self.page(after, head);
            async move { page }
        })
    }
}
