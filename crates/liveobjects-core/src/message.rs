//! Operations, object states and the message envelope they travel in.

use crate::data::{MapEntry, ObjectData};
use crate::error::{MergeError, Result};
use crate::object_id::{ObjectId, ObjectKind};
use crate::timeserial::{SiteTimeserials, Timeserial};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What an operation does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectOperationAction {
    MapCreate,
    MapSet,
    MapRemove,
    CounterCreate,
    CounterInc,
    ObjectDelete,
}

impl ObjectOperationAction {
    /// The variant this action applies to. `ObjectDelete` applies to both.
    pub fn target_kind(&self) -> Option<ObjectKind> {
        match self {
            ObjectOperationAction::MapCreate
            | ObjectOperationAction::MapSet
            | ObjectOperationAction::MapRemove => Some(ObjectKind::Map),
            ObjectOperationAction::CounterCreate | ObjectOperationAction::CounterInc => {
                Some(ObjectKind::Counter)
            }
            ObjectOperationAction::ObjectDelete => None,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            ObjectOperationAction::MapCreate | ObjectOperationAction::CounterCreate
        )
    }
}

/// Conflict resolution semantics of a map. Only LWW exists today.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapSemantics {
    #[default]
    Lww,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOp {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ObjectData>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterOp {
    pub amount: f64,
}

/// Full contents of a map, as carried by create operations and snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapState {
    #[serde(default)]
    pub semantics: MapSemantics,
    #[serde(default)]
    pub entries: BTreeMap<String, MapEntry>,
}

/// Full contents of a counter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    #[serde(default)]
    pub count: f64,
}

/// The unit of mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectOperation {
    pub action: ObjectOperationAction,
    pub object_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_op: Option<MapOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_op: Option<CounterOp>,
    /// Initial state of a map created by `MapCreate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapState>,
    /// Initial state of a counter created by `CounterCreate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<CounterState>,
    /// Creation nonce hashed into the object id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Encoded initial value hashed into the object id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<String>,
}

impl ObjectOperation {
    fn bare(action: ObjectOperationAction, object_id: ObjectId) -> Self {
        Self {
            action,
            object_id,
            map_op: None,
            counter_op: None,
            map: None,
            counter: None,
            nonce: None,
            initial_value: None,
        }
    }

    pub fn map_set(object_id: ObjectId, key: impl Into<String>, data: ObjectData) -> Self {
        Self {
            map_op: Some(MapOp {
                key: key.into(),
                data: Some(data),
            }),
            ..Self::bare(ObjectOperationAction::MapSet, object_id)
        }
    }

    pub fn map_remove(object_id: ObjectId, key: impl Into<String>) -> Self {
        Self {
            map_op: Some(MapOp {
                key: key.into(),
                data: None,
            }),
            ..Self::bare(ObjectOperationAction::MapRemove, object_id)
        }
    }

    pub fn counter_inc(object_id: ObjectId, amount: f64) -> Self {
        Self {
            counter_op: Some(CounterOp { amount }),
            ..Self::bare(ObjectOperationAction::CounterInc, object_id)
        }
    }

    pub fn map_create(
        object_id: ObjectId,
        map: MapState,
        nonce: impl Into<String>,
        initial_value: impl Into<String>,
    ) -> Self {
        Self {
            map: Some(map),
            nonce: Some(nonce.into()),
            initial_value: Some(initial_value.into()),
            ..Self::bare(ObjectOperationAction::MapCreate, object_id)
        }
    }

    pub fn counter_create(
        object_id: ObjectId,
        counter: CounterState,
        nonce: impl Into<String>,
        initial_value: impl Into<String>,
    ) -> Self {
        Self {
            counter: Some(counter),
            nonce: Some(nonce.into()),
            initial_value: Some(initial_value.into()),
            ..Self::bare(ObjectOperationAction::CounterCreate, object_id)
        }
    }

    pub fn object_delete(object_id: ObjectId) -> Self {
        Self::bare(ObjectOperationAction::ObjectDelete, object_id)
    }

    /// Check the fields required by the action and that the target id is
    /// compatible with it.
    pub fn validate(&self) -> Result<()> {
        let context = || format!("{:?} on {}", self.action, self.object_id);

        if self.object_id.as_str().is_empty() {
            return Err(MergeError::missing("objectId", context()));
        }
        ObjectId::parse(self.object_id.as_str())?;
        if let (Some(expected), Some(found)) = (self.action.target_kind(), self.object_id.kind()) {
            if expected != found {
                return Err(MergeError::VariantMismatch {
                    action: self.action,
                    object_id: self.object_id.clone(),
                    found,
                });
            }
        }

        match self.action {
            ObjectOperationAction::MapSet => {
                let map_op = self.map_op.as_ref().ok_or_else(|| MergeError::missing("mapOp", context()))?;
                map_op
                    .data
                    .as_ref()
                    .ok_or_else(|| MergeError::missing("mapOp.data", context()))?
                    .validate()
            }
            ObjectOperationAction::MapRemove => self
                .map_op
                .as_ref()
                .map(|_| ())
                .ok_or_else(|| MergeError::missing("mapOp", context())),
            ObjectOperationAction::CounterInc => {
                let counter_op = self
                    .counter_op
                    .as_ref()
                    .ok_or_else(|| MergeError::missing("counterOp", context()))?;
                if counter_op.amount.is_finite() {
                    Ok(())
                } else {
                    Err(MergeError::InvalidValue(format!(
                        "non-finite counter amount {}",
                        counter_op.amount
                    )))
                }
            }
            ObjectOperationAction::MapCreate | ObjectOperationAction::CounterCreate => {
                if self.object_id.is_root() {
                    return Err(MergeError::RootImmutable("re-created"));
                }
                if let Some(map) = &self.map {
                    for data in map.entries.values().filter_map(|e| e.data.as_ref()) {
                        data.validate()?;
                    }
                }
                Ok(())
            }
            ObjectOperationAction::ObjectDelete => {
                if self.object_id.is_root() {
                    Err(MergeError::RootImmutable("deleted"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Server-authoritative state of one object, delivered during sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectState {
    pub object_id: ObjectId,
    #[serde(default)]
    pub site_timeserials: SiteTimeserials,
    #[serde(default)]
    pub tombstone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_op: Option<ObjectOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<CounterState>,
}

impl ObjectState {
    /// Resolve the variant from whichever of `map`, `counter`, `createOp` or the
    /// id prefix is present, rejecting contradictions.
    pub fn kind(&self) -> Result<ObjectKind> {
        let malformed = |reason: &str| MergeError::MalformedState {
            object_id: self.object_id.clone(),
            reason: reason.to_string(),
        };

        let from_payload = match (&self.map, &self.counter) {
            (Some(_), Some(_)) => return Err(malformed("carries both map and counter")),
            (Some(_), None) => Some(ObjectKind::Map),
            (None, Some(_)) => Some(ObjectKind::Counter),
            (None, None) => None,
        };
        let from_create = self.create_op.as_ref().and_then(|op| op.action.target_kind());
        let from_id = self.object_id.kind();

        let mut resolved = None;
        for kind in [from_payload, from_create, from_id].into_iter().flatten() {
            match resolved {
                None => resolved = Some(kind),
                Some(existing) if existing != kind => {
                    return Err(malformed("conflicting object variants"))
                }
                Some(_) => {}
            }
        }
        resolved.ok_or_else(|| malformed("cannot determine object variant"))
    }

    pub fn validate(&self) -> Result<()> {
        ObjectId::parse(self.object_id.as_str())?;
        self.kind()?;
        if let Some(create_op) = &self.create_op {
            if !create_op.action.is_create() || create_op.object_id != self.object_id {
                return Err(MergeError::MalformedState {
                    object_id: self.object_id.clone(),
                    reason: "createOp is not a create operation for this object".to_string(),
                });
            }
            create_op.validate()?;
        }
        if let Some(map) = &self.map {
            for data in map.entries.values().filter_map(|e| e.data.as_ref()) {
                data.validate()?;
            }
        }
        Ok(())
    }
}

/// The envelope delivered over the channel. Live traffic carries `operation`,
/// sync traffic carries `object`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<Timeserial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ObjectOperation>,
    #[serde(default, rename = "object", skip_serializing_if = "Option::is_none")]
    pub object_state: Option<ObjectState>,
}

impl ObjectMessage {
    pub fn from_operation(operation: ObjectOperation) -> Self {
        Self {
            operation: Some(operation),
            ..Default::default()
        }
    }

    pub fn from_state(state: ObjectState) -> Self {
        Self {
            object_state: Some(state),
            ..Default::default()
        }
    }

    /// Stamp the causal origin of the message.
    pub fn with_origin(mut self, site_code: impl Into<String>, serial: impl Into<Timeserial>) -> Self {
        self.site_code = Some(site_code.into());
        self.serial = Some(serial.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
