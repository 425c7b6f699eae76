//! Change descriptors and the minimal-diff rules that produce them.

use crate::data::MapEntry;
use crate::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happened to a single map key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapChange {
    Updated,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    /// Changed keys of a map.
    Map(BTreeMap<String, MapChange>),
    /// Delta applied to a counter (not its absolute value).
    Counter { amount: f64 },
}

/// A change notification delivered to an object's subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectUpdate {
    pub object_id: ObjectId,
    pub kind: UpdateKind,
    /// Set when this update is the object becoming tombstoned.
    #[serde(default)]
    pub tombstone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl ObjectUpdate {
    pub fn map(object_id: ObjectId, changes: BTreeMap<String, MapChange>) -> Self {
        Self {
            object_id,
            kind: UpdateKind::Map(changes),
            tombstone: false,
            client_id: None,
            connection_id: None,
        }
    }

    pub fn counter(object_id: ObjectId, amount: f64) -> Self {
        Self {
            object_id,
            kind: UpdateKind::Counter { amount },
            tombstone: false,
            client_id: None,
            connection_id: None,
        }
    }

    /// A noop update is never delivered. Tombstoning is always observable.
    pub fn is_noop(&self) -> bool {
        if self.tombstone {
            return false;
        }
        match &self.kind {
            UpdateKind::Map(changes) => changes.is_empty(),
            UpdateKind::Counter { amount } => *amount == 0.0,
        }
    }

    /// Changed keys, for map updates.
    pub fn map_changes(&self) -> Option<&BTreeMap<String, MapChange>> {
        match &self.kind {
            UpdateKind::Map(changes) => Some(changes),
            UpdateKind::Counter { .. } => None,
        }
    }

    /// Delta, for counter updates.
    pub fn counter_amount(&self) -> Option<f64> {
        match &self.kind {
            UpdateKind::Counter { amount } => Some(*amount),
            UpdateKind::Map(_) => None,
        }
    }
}

/// Diff one key between two entry states.
pub fn diff_entry(prev: Option<&MapEntry>, next: Option<&MapEntry>) -> Option<MapChange> {
    let prev = prev.filter(|e| e.is_visible());
    let next = next.filter(|e| e.is_visible());

    match (prev, next) {
        (None, None) => None,
        (None, Some(_)) => Some(MapChange::Updated),
        (Some(_), None) => Some(MapChange::Removed),
        (Some(before), Some(after)) if before.data != after.data => Some(MapChange::Updated),
        (Some(_), Some(_)) => None,
    }
}

/// Diff two entry sets key by key, returning exactly the keys whose visible
/// value changed.
pub fn diff_map_entries(
    prev: &BTreeMap<String, MapEntry>,
    next: &BTreeMap<String, MapEntry>,
) -> BTreeMap<String, MapChange> {
    let mut changes = BTreeMap::new();

    for (key, before) in prev {
        if let Some(change) = diff_entry(Some(before), next.get(key)) {
            changes.insert(key.clone(), change);
        }
    }
    for (key, after) in next {
        if prev.contains_key(key) {
            continue;
        }
        if let Some(change) = diff_entry(None, Some(after)) {
            changes.insert(key.clone(), change);
        }
    }

    changes
}
