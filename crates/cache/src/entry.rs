//! Cache entries and their persisted envelope.
//!
//! Each physical key holds a JSON envelope:
//!
//! ```json
//! {"value":"aGVsbG8=","version":1729123456000000,"expires_at":"2024-10-17T00:00:00Z"}
//! ```
//!
//! An envelope whose `value` is `null` is a tombstone: the entry was
//! invalidated, and the tombstone remembers the version it was invalidated
//! at so the next write continues the sequence and so that a load racing
//! with the invalidation can tell the generation changed underneath it.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A live cache entry as observed by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Logical key (without the store prefix).
    pub key: String,
    /// Opaque cached bytes.
    pub value: Bytes,
    /// Monotonic per-key version; bumped by every write.
    pub version: u64,
    /// Instant at which the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    #[serde(with = "b64", default)]
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) version: u64,
    pub(crate) expires_at: DateTime<Utc>,
}

impl Envelope {
    pub(crate) fn live(value: Vec<u8>, version: u64, expires_at: DateTime<Utc>) -> Self {
        Self { value: Some(value), version, expires_at }
    }

    pub(crate) fn tombstone(version: u64, expires_at: DateTime<Utc>) -> Self {
        Self { value: None, version, expires_at }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        // Serializing a struct of plain fields into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub(crate) fn decode(key: &str, raw: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(raw)
            .map_err(|e| CacheError::Corrupt { key: key.to_owned(), reason: e.to_string() })
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Converts into a [`CacheEntry`] if this is a live, unexpired value.
    pub(crate) fn into_entry(self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        if self.is_expired(now) {
            return None;
        }
        self.value.map(|value| CacheEntry {
            key: key.to_owned(),
            value: Bytes::from(value),
            version: self.version,
            expires_at: self.expires_at,
        })
    }
}

/// Next version for a key: strictly above `previous`, and no lower than the
/// wall clock in microseconds so sequences stay increasing after a tombstone
/// has itself expired.
pub(crate) fn next_version(previous: Option<u64>, now: DateTime<Utc>) -> u64 {
    let floor = u64::try_from(now.timestamp_micros()).unwrap_or(0);
    match previous {
        Some(prev) => prev.saturating_add(1).max(floor),
        None => floor.max(1),
    }
}

mod b64 {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_is_never_an_entry() {
        let now = Utc::now();
        let tomb = Envelope::tombstone(7, now + chrono::Duration::seconds(60));
        assert!(tomb.into_entry("k", now).is_none());
    }

    #[test]
    fn test_expired_envelope_is_not_an_entry() {
        let now = Utc::now();
        let env = Envelope::live(b"v".to_vec(), 3, now);
        assert!(env.into_entry("k", now).is_none());
    }

    #[test]
    fn test_envelope_decodes_what_it_encodes() {
        let now = Utc::now();
        let env = Envelope::live(vec![0, 159, 146, 150], 42, now + chrono::Duration::seconds(5));
        let decoded = Envelope::decode("k", &env.encode()).unwrap();
        let entry = decoded.into_entry("k", now).unwrap();
        assert_eq!(entry.value.as_ref(), &[0, 159, 146, 150]);
        assert_eq!(entry.version, 42);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Envelope::decode("k", b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[test]
    fn test_next_version_strictly_increases() {
        let now = Utc::now();
        let floor = u64::try_from(now.timestamp_micros()).unwrap();
        assert_eq!(next_version(None, now), floor);
        assert_eq!(next_version(Some(floor + 10), now), floor + 11);
        assert_eq!(next_version(Some(3), now), floor);
    }
}
