//! Live objects and the per-variant merge rules.
//!
//! `LiveObject` is the closed sum of the two variants plus the bookkeeping
//! every object carries: site timeserials, tombstone state and whether its
//! create operation has been merged. All state transitions go through
//! [`LiveObject::apply_operation`] (live traffic) or
//! [`LiveObject::override_with_state`] (sync).

use crate::counter::LiveCounterData;
use crate::error::{MergeError, Result};
use crate::map::LiveMapData;
use crate::message::{ObjectMessage, ObjectOperation, ObjectOperationAction, ObjectState};
use crate::object_id::{ObjectId, ObjectKind};
use crate::timeserial::SiteTimeserials;
use crate::update::{diff_map_entries, MapChange, ObjectUpdate};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectValue {
    Map(LiveMapData),
    Counter(LiveCounterData),
}

impl ObjectValue {
    pub fn zero(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Map => ObjectValue::Map(LiveMapData::new()),
            ObjectKind::Counter => ObjectValue::Counter(LiveCounterData::new()),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectValue::Map(_) => ObjectKind::Map,
            ObjectValue::Counter(_) => ObjectKind::Counter,
        }
    }
}

/// Result of offering an operation to an object.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// The site gate rejected it: a duplicate or an older operation.
    Stale,
    /// Accepted. Carries the visible change, or `None` when nothing a reader
    /// can observe changed.
    Applied(Option<ObjectUpdate>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LiveObject {
    object_id: ObjectId,
    site_timeserials: SiteTimeserials,
    tombstone: bool,
    tombstoned_at: Option<i64>,
    created_at: Option<i64>,
    create_op_merged: bool,
    value: ObjectValue,
}

impl LiveObject {
    /// A zero-valued placeholder, used when an object is referenced before its
    /// create operation or snapshot entry has arrived.
    pub fn zero_value(object_id: ObjectId, kind: ObjectKind) -> Self {
        let created_at = object_id.created_at_ms();
        Self {
            object_id,
            site_timeserials: SiteTimeserials::new(),
            tombstone: false,
            tombstoned_at: None,
            created_at,
            create_op_merged: false,
            value: ObjectValue::zero(kind),
        }
    }

    /// Build an object straight from a snapshot entry.
    pub fn from_state(state: &ObjectState, at_ms: i64) -> Result<Self> {
        let mut object = Self::zero_value(state.object_id.clone(), state.kind()?);
        object.override_with_state(state, at_ms)?;
        Ok(object)
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn kind(&self) -> ObjectKind {
        self.value.kind()
    }

    pub fn site_timeserials(&self) -> &SiteTimeserials {
        &self.site_timeserials
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstone
    }

    pub fn tombstoned_at(&self) -> Option<i64> {
        self.tombstoned_at
    }

    pub fn created_at(&self) -> Option<i64> {
        self.created_at
    }

    pub fn create_op_merged(&self) -> bool {
        self.create_op_merged
    }

    pub fn value(&self) -> &ObjectValue {
        &self.value
    }

    pub fn as_map(&self) -> Option<&LiveMapData> {
        match &self.value {
            ObjectValue::Map(map) => Some(map),
            ObjectValue::Counter(_) => None,
        }
    }

    pub fn as_counter(&self) -> Option<&LiveCounterData> {
        match &self.value {
            ObjectValue::Counter(counter) => Some(counter),
            ObjectValue::Map(_) => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut LiveMapData> {
        match &mut self.value {
            ObjectValue::Map(map) => Some(map),
            ObjectValue::Counter(_) => None,
        }
    }

    /// Objects referenced by visible entries of this map.
    pub fn references(&self) -> Vec<&ObjectId> {
        match &self.value {
            ObjectValue::Map(map) if !self.tombstone => {
                map.entries().values().filter_map(|e| e.reference()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Offer a live operation to this object.
    ///
    /// The site gate runs first: anything not strictly newer than what this
    /// object has already accepted from the same site is `Stale`. Accepted
    /// operations always advance the site's serial, even when the per-key LWW
    /// comparison or a tombstone then turns them into a noop.
    pub fn apply_operation(
        &mut self,
        op: &ObjectOperation,
        msg: &ObjectMessage,
    ) -> Result<ApplyOutcome> {
        if op.object_id != self.object_id {
            return Err(MergeError::WrongObject {
                operation: op.object_id.clone(),
                object_id: self.object_id.clone(),
            });
        }
        op.validate()?;
        if let Some(expected) = op.action.target_kind() {
            if expected != self.kind() {
                return Err(MergeError::VariantMismatch {
                    action: op.action,
                    object_id: self.object_id.clone(),
                    found: self.kind(),
                });
            }
        }

        let context = || format!("{:?} on {}", op.action, op.object_id);
        let serial = msg
            .serial
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MergeError::missing("serial", context()))?;
        let site_code = msg
            .site_code
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MergeError::missing("siteCode", context()))?;

        if !self.site_timeserials.can_apply(site_code, serial) {
            return Ok(ApplyOutcome::Stale);
        }
        self.site_timeserials.record(site_code, serial.clone());

        if self.tombstone {
            return Ok(ApplyOutcome::Applied(None));
        }

        let at_ms = msg.timestamp.unwrap_or_default();
        let update = match op.action {
            ObjectOperationAction::MapCreate | ObjectOperationAction::CounterCreate => {
                self.merge_create_op(op, at_ms)
            }
            ObjectOperationAction::MapSet => {
                let map_op = op
                    .map_op
                    .as_ref()
                    .ok_or_else(|| MergeError::missing("mapOp", context()))?;
                let data = map_op
                    .data
                    .clone()
                    .ok_or_else(|| MergeError::missing("mapOp.data", context()))?;
                let change = self
                    .map_mut()
                    .apply_set(&map_op.key, data, Some(serial));
                self.key_update(&map_op.key, change)
            }
            ObjectOperationAction::MapRemove => {
                let map_op = op
                    .map_op
                    .as_ref()
                    .ok_or_else(|| MergeError::missing("mapOp", context()))?;
                let change = self
                    .map_mut()
                    .apply_remove(&map_op.key, Some(serial), at_ms);
                self.key_update(&map_op.key, change)
            }
            ObjectOperationAction::CounterInc => {
                let amount = op
                    .counter_op
                    .as_ref()
                    .ok_or_else(|| MergeError::missing("counterOp", context()))?
                    .amount;
                let applied = self.counter_mut().increment(amount);
                ObjectUpdate::counter(self.object_id.clone(), applied)
            }
            ObjectOperationAction::ObjectDelete => self.tombstone(at_ms),
        };

        let mut update = update;
        update.client_id = msg.client_id.clone();
        update.connection_id = msg.connection_id.clone();
        // Every accepted increment is observable, even a zero delta.
        let always_emit = matches!(op.action, ObjectOperationAction::CounterInc);
        Ok(ApplyOutcome::Applied(
            Some(update).filter(|u| always_emit || !u.is_noop()),
        ))
    }

    /// Replace this object's state with a server-authoritative snapshot entry.
    ///
    /// Site timeserials are overridden wholesale, not merged. A tombstoned
    /// local object is resurrected by a live snapshot entry. The returned
    /// update is the diff against the previous state and may be a noop.
    pub fn override_with_state(&mut self, state: &ObjectState, at_ms: i64) -> Result<ObjectUpdate> {
        if state.object_id != self.object_id {
            return Err(MergeError::WrongObject {
                operation: state.object_id.clone(),
                object_id: self.object_id.clone(),
            });
        }
        if state.kind()? != self.kind() {
            return Err(MergeError::MalformedState {
                object_id: self.object_id.clone(),
                reason: format!("snapshot variant differs from local {}", self.kind()),
            });
        }

        self.site_timeserials = state.site_timeserials.clone();

        if state.tombstone {
            if self.tombstone {
                return Ok(self.empty_update());
            }
            return Ok(self.tombstone(at_ms));
        }

        let kind = self.kind();
        let previous = std::mem::replace(
            &mut self.value,
            match (state.map.as_ref(), state.counter.as_ref(), kind) {
                (Some(map), _, ObjectKind::Map) => ObjectValue::Map(LiveMapData::from_state(map, at_ms)),
                (_, Some(counter), ObjectKind::Counter) => {
                    ObjectValue::Counter(LiveCounterData::from_state(counter))
                }
                (_, _, kind) => ObjectValue::zero(kind),
            },
        );
        self.tombstone = false;
        self.tombstoned_at = None;
        self.create_op_merged = false;

        if let Some(create_op) = &state.create_op {
            self.merge_create_op(create_op, at_ms);
        }

        Ok(self.diff_from(&previous))
    }

    /// Mark the object deleted, clearing its data. The returned update carries
    /// the data diff down to zero with `tombstone` set.
    pub fn tombstone(&mut self, at_ms: i64) -> ObjectUpdate {
        let kind = self.kind();
        let previous = std::mem::replace(&mut self.value, ObjectValue::zero(kind));
        self.tombstone = true;
        self.tombstoned_at = Some(at_ms);

        let mut update = self.diff_from(&previous);
        update.tombstone = true;
        update
    }

    /// Snapshot entry describing this object, as a server would emit it.
    pub fn to_state(&self) -> ObjectState {
        let (map, counter) = match &self.value {
            ObjectValue::Map(map) => (Some(map.to_state()), None),
            ObjectValue::Counter(counter) => (None, Some(counter.to_state())),
        };
        ObjectState {
            object_id: self.object_id.clone(),
            site_timeserials: self.site_timeserials.clone(),
            tombstone: self.tombstone,
            create_op: None,
            map,
            counter,
        }
    }

    /// Merge a create operation's initial state, at most once per object.
    fn merge_create_op(&mut self, op: &ObjectOperation, at_ms: i64) -> ObjectUpdate {
        if self.create_op_merged {
            return self.empty_update();
        }
        self.create_op_merged = true;

        match &mut self.value {
            ObjectValue::Map(map) => {
                let changes = op
                    .map
                    .as_ref()
                    .map(|initial| map.merge_initial(initial, at_ms))
                    .unwrap_or_default();
                ObjectUpdate::map(self.object_id.clone(), changes)
            }
            ObjectValue::Counter(counter) => {
                let amount = op.counter.as_ref().map(|c| c.count).unwrap_or(0.0);
                ObjectUpdate::counter(self.object_id.clone(), counter.increment(amount))
            }
        }
    }

    fn diff_from(&self, previous: &ObjectValue) -> ObjectUpdate {
        match (previous, &self.value) {
            (ObjectValue::Map(before), ObjectValue::Map(after)) => ObjectUpdate::map(
                self.object_id.clone(),
                diff_map_entries(before.entries(), after.entries()),
            ),
            (ObjectValue::Counter(before), ObjectValue::Counter(after)) => {
                ObjectUpdate::counter(self.object_id.clone(), after.value() - before.value())
            }
            _ => self.empty_update(),
        }
    }

    fn empty_update(&self) -> ObjectUpdate {
        match self.kind() {
            ObjectKind::Map => ObjectUpdate::map(self.object_id.clone(), BTreeMap::new()),
            ObjectKind::Counter => ObjectUpdate::counter(self.object_id.clone(), 0.0),
        }
    }

    fn key_update(&self, key: &str, change: Option<MapChange>) -> ObjectUpdate {
        let changes = change
            .map(|c| BTreeMap::from([(key.to_string(), c)]))
            .unwrap_or_default();
        ObjectUpdate::map(self.object_id.clone(), changes)
    }

    fn map_mut(&mut self) -> &mut LiveMapData {
        match &mut self.value {
            ObjectValue::Map(map) => map,
            // Variant is checked against the action before dispatch.
            ObjectValue::Counter(_) => unreachable!("map operation on a counter"),
        }
    }

    fn counter_mut(&mut self) -> &mut LiveCounterData {
        match &mut self.value {
            ObjectValue::Counter(counter) => counter,
            ObjectValue::Map(_) => unreachable!("counter operation on a map"),
        }
    }
}
