//! The cached form of authoritative records.
//!
//! Read-through and reconciliation both populate the cache, so they must agree
//! on the key an entity lives under and on the bytes stored there.

use bilicore_cache::family_key;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{StoreError, StoreResult},
    types::{AuthoritativeRecord, EntityId, Revision, StoreKind},
};

/// Logical cache key of an entity: `"{kind}::{id}"`.
#[must_use]
pub fn cache_key(kind: StoreKind, id: &EntityId) -> String {
    family_key(kind.as_str(), id.as_str())
}

/// An [`AuthoritativeRecord`] as stored in the cache.
///
/// ```json
/// {"kind":"document","entity_id":"v1","revision":3,"payload":"eyJ0aXRsZSI6Imh..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord {
    /// Source store.
    pub kind: StoreKind,
    /// Entity id.
    pub entity_id: EntityId,
    /// Revision the payload was read at.
    pub revision: Revision,
    /// Entity payload.
    #[serde(with = "crate::b64")]
    pub payload: Bytes,
}

impl CachedRecord {
    /// Encodes for the cache.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // Plain fields only; serialization into a Vec cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decodes cached bytes.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] when the bytes are not a cached record.
    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(raw).map_err(|e| StoreError::corrupt("cached record", e.to_string()))
    }

    /// The cache key this record belongs under.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(self.kind, &self.entity_id)
    }
}

impl From<AuthoritativeRecord> for CachedRecord {
    fn from(record: AuthoritativeRecord) -> Self {
        Self {
            kind: record.kind,
            entity_id: record.id,
            revision: record.revision,
            payload: record.payload,
        }
    }
}

impl From<CachedRecord> for AuthoritativeRecord {
    fn from(cached: CachedRecord) -> Self {
        Self {
            kind: cached.kind,
            id: cached.entity_id,
            revision: cached.revision,
            payload: cached.payload,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key(StoreKind::Relational, &"u42".into()), "relational::u42");
    }

    #[test]
    fn test_decode_rejects_foreign_bytes() {
        assert!(matches!(CachedRecord::decode(b"1"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_encoding_is_stable() {
        let cached = CachedRecord {
            kind: StoreKind::Document,
            entity_id: "v1".into(),
            revision: Revision::new(3),
            payload: Bytes::from_static(b"hi"),
        };
        assert_eq!(
            cached.encode(),
            Bytes::from_static(br#"{"kind":"document","entity_id":"v1","revision":3,"payload":"aGk="}"#)
        );
        assert_eq!(CachedRecord::decode(&cached.encode()).unwrap(), cached);
    }
}
