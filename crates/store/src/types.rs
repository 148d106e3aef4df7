//! Identifiers and records shared by every authoritative store.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Persistence technology behind a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Row-oriented store with a change log.
    Relational,
    /// Document collection with a change feed.
    Document,
}

impl StoreKind {
    /// Every kind, in a stable order.
    pub const ALL: [StoreKind; 2] = [StoreKind::Relational, StoreKind::Document];

    /// Lowercase name, also used as the cache family of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational" => Ok(Self::Relational),
            "document" => Ok(Self::Document),
            other => Err(StoreError::corrupt("store kind", format!("unknown kind {other:?}"))),
        }
    }
}

/// Identifier of an entity within one store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-entity revision, bumped by every committed write.
///
/// The first write of an entity yields revision 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Wraps a raw revision number.
    #[must_use]
    pub const fn new(revision: u64) -> Self {
        Self(revision)
    }

    /// The raw revision number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The revision that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position in a store's change sequence.
///
/// Only the store that produced a cursor can interpret it. Scanning from a
/// cursor yields exactly the changes committed after the change it was
/// yielded with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a raw cursor string, e.g. one read back from a checkpoint.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw cursor string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn at(tag: &str, seq: u64) -> Self {
        Self(format!("{tag}/{seq}"))
    }

    /// Sequence number encoded in a cursor produced under `tag`.
    pub(crate) fn seq(&self, tag: &str) -> Result<u64, StoreError> {
        self.0
            .strip_prefix(tag)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|seq| seq.parse().ok())
            .ok_or_else(|| StoreError::InvalidCursor(self.0.clone()))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entity as read from its authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeRecord {
    /// Store the record came from.
    pub kind: StoreKind,
    /// Entity id.
    pub id: EntityId,
    /// Revision of the payload.
    pub revision: Revision,
    /// Opaque entity payload.
    pub payload: Bytes,
}

/// One entry of a change scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Changed entity.
    pub id: EntityId,
    /// Revision the change produced.
    pub revision: Revision,
    /// Resume point just after this change.
    pub cursor: Cursor,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_kind_names_round_trip() {
        for kind in StoreKind::ALL {
            assert_eq!(kind.as_str().parse::<StoreKind>().unwrap(), kind);
        }
        assert!("graph".parse::<StoreKind>().is_err());
    }

    #[test]
    fn test_cursor_seq_requires_matching_tag() {
        let cursor = Cursor::at("rel", 42);
        assert_eq!(cursor.as_str(), "rel/42");
        assert_eq!(cursor.seq("rel").unwrap(), 42);
        assert!(matches!(cursor.seq("doc:video"), Err(StoreError::InvalidCursor(_))));
        assert!(Cursor::from_raw("rel/x").seq("rel").is_err());
    }

    #[test]
    fn test_revision_ordering() {
        let first = Revision::new(1);
        assert!(first.next() > first);
        assert_eq!(Revision::new(u64::MAX).next(), Revision::new(u64::MAX));
    }
}
