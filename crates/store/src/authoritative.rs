//! The capability interface every authoritative store implements.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{
    error::StoreResult,
    types::{AuthoritativeRecord, Change, Cursor, EntityId, Revision, StoreKind},
};

/// Default number of changes fetched per scan page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 256;

/// Read, write and change-scan access to one source of truth.
///
/// Implementations are selected when the service is composed; callers hold
/// them as `Arc<dyn AuthoritativeStore>` and never inspect the concrete type.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync + fmt::Debug {
    /// Which persistence technology this store is.
    fn kind(&self) -> StoreKind;

    /// Reads the current revision of an entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`](crate::StoreError::NotFound) when the entity
    /// does not exist, or a transport error.
    async fn read(&self, id: &EntityId) -> StoreResult<AuthoritativeRecord>;

    /// Commits `payload` as the entity's new state and returns the revision
    /// it was committed at.
    ///
    /// # Errors
    ///
    /// Transport or contention errors. Nothing is committed on error.
    async fn write(&self, id: &EntityId, payload: Bytes) -> StoreResult<Revision>;

    /// Lazily yields every change committed after `cursor` (from the very
    /// beginning when `None`), oldest first.
    ///
    /// The sequence is finite: it ends at the head observed when the scan
    /// started. Each yielded [`Change::cursor`] resumes a later scan right
    /// after that change. An error ends the sequence.
    fn scan_changes_since(&self, cursor: Option<&Cursor>) -> BoxStream<'_, StoreResult<Change>>;
}
