//! The object graph store.

use crate::error::{ObjectsError, Result};
use liveobjects_core::{
    diff_entry, LiveObject, MapChange, MapEntry, MergeError, ObjectId, ObjectKind, ObjectUpdate,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A single object behind its own lock, so live operations on one object do
/// not block readers of another.
pub type ObjectCell = Arc<RwLock<LiveObject>>;

/// Maps object ids to live objects. The root map is always present.
pub struct ObjectsPool {
    objects: RwLock<HashMap<ObjectId, ObjectCell>>,
}

impl ObjectsPool {
    pub fn new() -> Self {
        let pool = Self::empty();
        pool.insert(LiveObject::zero_value(ObjectId::root(), ObjectKind::Map));
        pool
    }

    /// A pool without a root, used as the working graph while a sync is built.
    pub(crate) fn empty() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<ObjectCell> {
        self.objects.read().get(object_id).cloned()
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.objects.read().contains_key(object_id)
    }

    /// Fetch an object, creating a zero-valued placeholder of `kind` if it
    /// has not been seen yet. Creation emits no notification.
    pub fn get_or_create(&self, object_id: &ObjectId, kind: ObjectKind) -> ObjectCell {
        if let Some(cell) = self.get(object_id) {
            return cell;
        }
        self.objects
            .write()
            .entry(object_id.clone())
            .or_insert_with(|| {
                debug!(object_id = %object_id, kind = %kind, "Created placeholder object");
                Arc::new(RwLock::new(LiveObject::zero_value(object_id.clone(), kind)))
            })
            .clone()
    }

    pub(crate) fn insert(&self, object: LiveObject) {
        self.objects
            .write()
            .insert(object.object_id().clone(), Arc::new(RwLock::new(object)));
    }

    /// Mark an object tombstoned. The record is kept until garbage
    /// collection so re-delivered operations still hit the site gate.
    /// Returns the tombstone update, or `None` if the object is unknown or
    /// already tombstoned.
    pub fn delete(&self, object_id: &ObjectId, at_ms: i64) -> Result<Option<ObjectUpdate>> {
        if object_id.is_root() {
            return Err(MergeError::RootImmutable("deleted").into());
        }
        let Some(cell) = self.get(object_id) else {
            return Ok(None);
        };
        let mut object = cell.write();
        if object.is_tombstoned() {
            return Ok(None);
        }
        Ok(Some(object.tombstone(at_ms)))
    }

    pub fn root(&self) -> ObjectCell {
        self.get_or_create(&ObjectId::root(), ObjectKind::Map)
    }

    /// Look up an object and check its variant.
    pub fn get_typed(&self, object_id: &ObjectId, expected: ObjectKind) -> Result<ObjectCell> {
        let cell = self
            .get(object_id)
            .ok_or_else(|| ObjectsError::NotFound(object_id.clone()))?;
        let found = cell.read().kind();
        if found != expected {
            return Err(ObjectsError::WrongType {
                object_id: object_id.clone(),
                expected,
                found,
            });
        }
        Ok(cell)
    }

    pub fn is_tombstoned(&self, object_id: &ObjectId) -> bool {
        self.get(object_id)
            .map(|cell| cell.read().is_tombstoned())
            .unwrap_or(false)
    }

    /// Whether readers see this entry: it is live and does not point at a
    /// tombstoned object.
    pub fn entry_visible(&self, entry: &MapEntry) -> bool {
        entry.is_visible() && !entry.reference().is_some_and(|id| self.is_tombstoned(id))
    }

    /// Diff one key as readers see it, hiding references to tombstoned
    /// objects on both sides.
    pub(crate) fn visible_change(
        &self,
        before: Option<&MapEntry>,
        after: Option<&MapEntry>,
    ) -> Option<MapChange> {
        diff_entry(
            before.filter(|e| self.entry_visible(e)),
            after.filter(|e| self.entry_visible(e)),
        )
    }

    /// Live maps holding a visible entry that references `target`, with the
    /// keys that do.
    pub fn referrers(&self, target: &ObjectId) -> Vec<(ObjectId, Vec<String>)> {
        let cells: Vec<ObjectCell> = self.objects.read().values().cloned().collect();

        let mut referrers = Vec::new();
        for cell in cells {
            let object = cell.read();
            let Some(map) = object.as_map() else {
                continue;
            };
            if object.is_tombstoned() {
                continue;
            }
            let keys: Vec<String> = map
                .entries()
                .iter()
                .filter(|(_, e)| e.is_visible() && e.reference() == Some(target))
                .map(|(k, _)| k.clone())
                .collect();
            if !keys.is_empty() {
                referrers.push((object.object_id().clone(), keys));
            }
        }
        referrers
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn cells(&self) -> Vec<ObjectCell> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Point-in-time copy of every object.
    pub fn snapshot(&self) -> HashMap<ObjectId, LiveObject> {
        self.cells()
            .into_iter()
            .map(|cell| {
                let object = cell.read().clone();
                (object.object_id().clone(), object)
            })
            .collect()
    }

    /// Replace the whole graph with `working` in one step.
    pub(crate) fn replace_with(&self, working: ObjectsPool) {
        let objects = working.objects.into_inner();
        *self.objects.write() = objects;
    }

    /// Remove objects outright. The root is never removed.
    pub(crate) fn evict(&self, object_ids: &[ObjectId]) -> usize {
        let mut objects = self.objects.write();
        object_ids
            .iter()
            .filter(|id| !id.is_root())
            .filter(|id| objects.remove(*id).is_some())
            .count()
    }
}

impl Default for ObjectsPool {
    fn default() -> Self {
        Self::new()
    }
}
