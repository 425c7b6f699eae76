//! Object identifiers.
//!
//! Ids have the form `<kind>:<hash>@<msTimestamp>`, where `hash` is the
//! unpadded base64url SHA-256 of `initialValue ":" nonce`. The root object uses
//! the fixed id `root` and is always a map.

use crate::error::{MergeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Well-known id of the root map.
pub const ROOT_OBJECT_ID: &str = "root";

/// The closed set of object variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Map,
    Counter,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Map => "map",
            ObjectKind::Counter => "counter",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "map" => Some(ObjectKind::Map),
            "counter" => Some(ObjectKind::Counter),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globally unique, immutable identifier of a live object.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap a raw id without validating it.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(ROOT_OBJECT_ID.to_string())
    }

    /// Derive the id for a new object from its encoded initial value and a
    /// creation nonce.
    pub fn derive(kind: ObjectKind, initial_value: &str, nonce: &str, timestamp_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(initial_value.as_bytes());
        hasher.update(b":");
        hasher.update(nonce.as_bytes());
        let hash = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self(format!("{}:{}@{}", kind, hash, timestamp_ms))
    }

    /// Parse and validate an id.
    pub fn parse(id: &str) -> Result<Self> {
        let parsed = Self(id.to_string());
        if parsed.is_root() || (parsed.kind().is_some() && parsed.created_at_ms().is_some()) {
            Ok(parsed)
        } else {
            Err(MergeError::InvalidObjectId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_OBJECT_ID
    }

    /// The variant encoded in the id, if recognisable.
    pub fn kind(&self) -> Option<ObjectKind> {
        if self.is_root() {
            return Some(ObjectKind::Map);
        }
        let (prefix, _) = self.0.split_once(':')?;
        ObjectKind::from_prefix(prefix)
    }

    /// Creation time embedded in the id.
    pub fn created_at_ms(&self) -> Option<i64> {
        let (_, timestamp) = self.0.rsplit_once('@')?;
        timestamp.parse().ok()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = ObjectId::derive(ObjectKind::Counter, "{\"count\":1}", "nonce", 1_700_000_000_000);
        let b = ObjectId::derive(ObjectKind::Counter, "{\"count\":1}", "nonce", 1_700_000_000_000);
        let c = ObjectId::derive(ObjectKind::Counter, "{\"count\":1}", "other", 1_700_000_000_000);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("counter:"));
        assert!(a.as_str().ends_with("@1700000000000"));
        assert!(!a.as_str().contains('='));
    }

    #[test]
    fn test_kind_and_timestamp() {
        let id = ObjectId::derive(ObjectKind::Map, "{}", "n", 42);
        assert_eq!(id.kind(), Some(ObjectKind::Map));
        assert_eq!(id.created_at_ms(), Some(42));

        assert_eq!(ObjectId::root().kind(), Some(ObjectKind::Map));
        assert_eq!(ObjectId::new("widget:abc@1").kind(), None);
    }

    #[test]
    fn test_parse() {
        assert!(ObjectId::parse("root").is_ok());
        assert!(ObjectId::parse("map:abc@123").is_ok());
        assert!(ObjectId::parse("counter:abc@123").is_ok());
        assert!(ObjectId::parse("map:abc").is_err());
        assert!(ObjectId::parse("set:abc@1").is_err());
        assert!(ObjectId::parse("").is_err());
    }
}
