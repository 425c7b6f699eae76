//! Values stored in map entries.

use crate::error::{MergeError, Result};
use crate::object_id::ObjectId;
use crate::timeserial::Timeserial;
use serde::{Deserialize, Serialize};

/// The payload of a map entry: either a direct value or a reference to
/// another live object, which is how composite trees are built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectData {
    ObjectId(ObjectId),
    String(String),
    Number(f64),
    Boolean(bool),
    Bytes(#[serde(with = "bytes_base64")] Vec<u8>),
    /// A JSON object or array.
    Json(serde_json::Value),
}

impl ObjectData {
    /// Convert a JSON value, mapping scalars to their primitive variants.
    /// `null` has no representation and yields `None`.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(ObjectData::Boolean(b)),
            serde_json::Value::Number(n) => n.as_f64().map(ObjectData::Number),
            serde_json::Value::String(s) => Some(ObjectData::String(s)),
            json @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Some(ObjectData::Json(json))
            }
        }
    }

    /// The referenced object, if this is a reference.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            ObjectData::ObjectId(id) => Some(id),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ObjectData::ObjectId(id) => ObjectId::parse(id.as_str()).map(|_| ()),
            ObjectData::Number(n) if !n.is_finite() => {
                Err(MergeError::InvalidValue(format!("non-finite number {}", n)))
            }
            ObjectData::Json(json) if !(json.is_object() || json.is_array()) => Err(
                MergeError::InvalidValue("json data must be an object or an array".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl From<&str> for ObjectData {
    fn from(s: &str) -> Self {
        ObjectData::String(s.to_string())
    }
}

impl From<String> for ObjectData {
    fn from(s: String) -> Self {
        ObjectData::String(s)
    }
}

impl From<f64> for ObjectData {
    fn from(n: f64) -> Self {
        ObjectData::Number(n)
    }
}

impl From<i64> for ObjectData {
    fn from(n: i64) -> Self {
        ObjectData::Number(n as f64)
    }
}

impl From<bool> for ObjectData {
    fn from(b: bool) -> Self {
        ObjectData::Boolean(b)
    }
}

impl From<Vec<u8>> for ObjectData {
    fn from(bytes: Vec<u8>) -> Self {
        ObjectData::Bytes(bytes)
    }
}

impl From<ObjectId> for ObjectData {
    fn from(id: ObjectId) -> Self {
        ObjectData::ObjectId(id)
    }
}

/// A single key of a map.
///
/// A tombstoned entry keeps its timeserial so later operations on the key can
/// still be ordered against the removal, but it drops its data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapEntry {
    #[serde(default)]
    pub tombstone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeserial: Option<Timeserial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ObjectData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<i64>,
}

impl MapEntry {
    pub fn live(data: ObjectData, timeserial: Option<Timeserial>) -> Self {
        Self {
            tombstone: false,
            timeserial,
            data: Some(data),
            tombstoned_at: None,
        }
    }

    pub fn removed(timeserial: Option<Timeserial>, at_ms: i64) -> Self {
        Self {
            tombstone: true,
            timeserial,
            data: None,
            tombstoned_at: Some(at_ms),
        }
    }

    /// Whether the entry carries a value a reader can observe.
    pub fn is_visible(&self) -> bool {
        !self.tombstone && self.data.is_some()
    }

    /// The referenced object of a visible entry.
    pub fn reference(&self) -> Option<&ObjectId> {
        if self.tombstone {
            return None;
        }
        self.data.as_ref().and_then(ObjectData::object_id)
    }
}

mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let data = ObjectData::ObjectId(ObjectId::new("map:abc@1"));
        assert_eq!(serde_json::to_value(&data).unwrap(), json!({"objectId": "map:abc@1"}));

        let data = ObjectData::Bytes(vec![1, 2, 3]);
        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(encoded, json!({"bytes": "AQID"}));
        let decoded: ObjectData = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(ObjectData::from_json(json!(null)), None);
        assert_eq!(ObjectData::from_json(json!(3)), Some(ObjectData::Number(3.0)));
        assert_eq!(ObjectData::from_json(json!("x")), Some(ObjectData::String("x".into())));
        assert_eq!(
            ObjectData::from_json(json!([1, 2])),
            Some(ObjectData::Json(json!([1, 2])))
        );
    }

    #[test]
    fn test_validate() {
        assert!(ObjectData::Json(json!({"a": 1})).validate().is_ok());
        assert!(ObjectData::Json(json!(1)).validate().is_err());
        assert!(ObjectData::Number(f64::NAN).validate().is_err());
        assert!(ObjectData::ObjectId(ObjectId::new("nope")).validate().is_err());
    }

    #[test]
    fn test_entry_visibility() {
        let live = MapEntry::live("v".into(), Some("01".into()));
        assert!(live.is_visible());

        let removed = MapEntry::removed(Some("02".into()), 10);
        assert!(!removed.is_visible());
        assert_eq!(removed.timeserial, Some("02".into()));
        assert!(removed.data.is_none());
    }
}
