//! Sync/resync: reconciling a server snapshot against the local graph.
//!
//! A snapshot may arrive in pages. Pages are accumulated by the
//! [`SyncCoordinator`]; once the final page arrives the whole set is applied
//! by [`apply_snapshot`], which builds a complete working graph, diffs it
//! against the current one and swaps it in. Nothing is swapped if any entry
//! is malformed.

use crate::error::{ObjectsError, Result};
use crate::pool::ObjectsPool;
use liveobjects_core::{
    LiveObject, MapState, ObjectId, ObjectState, ObjectUpdate, SiteTimeserials, UpdateKind,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Split a sync serial of the form `<sequenceId>:<cursor>`. A serial
/// without a cursor, or with an empty one, ends the sequence.
pub fn parse_sync_serial(sync_serial: &str) -> (&str, Option<&str>) {
    match sync_serial.split_once(':') {
        Some((sequence, cursor)) if !cursor.is_empty() => (sequence, Some(cursor)),
        Some((sequence, _)) => (sequence, None),
        None => (sync_serial, None),
    }
}

#[derive(Debug)]
struct SyncSequence {
    id: Option<String>,
    states: Vec<ObjectState>,
}

/// Accumulates sync pages until a sequence completes.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    current: Option<SyncSequence>,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.current.is_some()
    }

    /// Expect a sync sequence. Returns false if one is already under way.
    pub fn begin(&mut self) -> bool {
        if self.current.is_some() {
            return false;
        }
        self.current = Some(SyncSequence {
            id: None,
            states: Vec::new(),
        });
        true
    }

    /// Add a page. Returns the complete state set when `sync_serial` ends
    /// the sequence. A page from a different sequence discards whatever was
    /// received so far.
    pub fn add_page(
        &mut self,
        sync_serial: &str,
        states: Vec<ObjectState>,
    ) -> Option<Vec<ObjectState>> {
        let (sequence_id, cursor) = parse_sync_serial(sync_serial);
        let current = self.current.get_or_insert_with(|| SyncSequence {
            id: None,
            states: Vec::new(),
        });

        match &current.id {
            Some(id) if id != sequence_id => {
                debug!(
                    previous = %id,
                    sequence = %sequence_id,
                    discarded = current.states.len(),
                    "New sync sequence replaces partial one"
                );
                current.states.clear();
                current.id = Some(sequence_id.to_string());
            }
            Some(_) => {}
            None => current.id = Some(sequence_id.to_string()),
        }
        current.states.extend(states);

        match cursor {
            Some(_) => None,
            None => self.current.take().map(|sequence| sequence.states),
        }
    }

    /// Drop a partially received sequence. Returns whether one was pending.
    pub fn abort(&mut self) -> bool {
        self.current.take().is_some()
    }
}

/// Apply a complete snapshot to `pool`, returning the visible changes.
///
/// Objects in the snapshot replace their local counterparts wholesale,
/// including site timeserials. Non-root objects missing from the snapshot are
/// tombstoned; a missing root is reset to an empty map. References to objects
/// the snapshot does not describe get zero-valued placeholders.
pub fn apply_snapshot(
    pool: &ObjectsPool,
    states: &[ObjectState],
    now_ms: i64,
) -> Result<Vec<ObjectUpdate>> {
    let empty_root = ObjectState {
        object_id: ObjectId::root(),
        site_timeserials: SiteTimeserials::new(),
        tombstone: false,
        create_op: None,
        map: Some(MapState::default()),
        counter: None,
    };
    let mut incoming: BTreeMap<&ObjectId, &ObjectState> = BTreeMap::new();
    for state in states {
        state
            .validate()
            .map_err(|e| ObjectsError::MalformedSync(e.to_string()))?;
        incoming.insert(&state.object_id, state);
    }

    let previous = pool.snapshot();
    let mut working: HashMap<ObjectId, LiveObject> = HashMap::new();
    let mut updates: BTreeMap<ObjectId, ObjectUpdate> = BTreeMap::new();

    if !incoming.contains_key(&empty_root.object_id) {
        incoming.insert(&empty_root.object_id, &empty_root);
    }

    for (object_id, state) in &incoming {
        let kind = state
            .kind()
            .map_err(|e| ObjectsError::MalformedSync(e.to_string()))?;
        let mut object = previous
            .get(*object_id)
            .filter(|existing| existing.kind() == kind)
            .cloned()
            .unwrap_or_else(|| LiveObject::zero_value((*object_id).clone(), kind));
        let update = object
            .override_with_state(state, now_ms)
            .map_err(|e| ObjectsError::MalformedSync(e.to_string()))?;
        updates.insert((*object_id).clone(), update);
        working.insert((*object_id).clone(), object);
    }

    for (object_id, object) in &previous {
        if working.contains_key(object_id) {
            continue;
        }
        let mut object = object.clone();
        if !object.is_tombstoned() {
            debug!(object_id = %object_id, "Object absent from sync, tombstoning");
            updates.insert(object_id.clone(), object.tombstone(now_ms));
        }
        working.insert(object_id.clone(), object);
    }

    let dangling: BTreeSet<ObjectId> = working
        .values()
        .flat_map(|object| object.references())
        .filter(|id| !working.contains_key(*id))
        .cloned()
        .collect();
    for object_id in dangling {
        if let Some(kind) = object_id.kind() {
            working.insert(object_id.clone(), LiveObject::zero_value(object_id, kind));
        }
    }

    refine_map_updates(&previous, &working, &mut updates);

    let graph = ObjectsPool::empty();
    for object in working.into_values() {
        graph.insert(object);
    }
    pool.replace_with(graph);

    Ok(updates.into_values().filter(|u| !u.is_noop()).collect())
}

/// Recompute map changes as readers see them: an entry referencing a
/// tombstoned object is hidden, so a reference whose target died in this
/// sync reads as removed even though the entry itself did not change.
fn refine_map_updates(
    previous: &HashMap<ObjectId, LiveObject>,
    working: &HashMap<ObjectId, LiveObject>,
    updates: &mut BTreeMap<ObjectId, ObjectUpdate>,
) {
    let tombstoned_before = |id: &ObjectId| previous.get(id).is_some_and(|o| o.is_tombstoned());
    let tombstoned_after = |id: &ObjectId| working.get(id).is_some_and(|o| o.is_tombstoned());

    for (object_id, object) in working {
        let Some(after) = object.as_map() else {
            continue;
        };
        let empty = BTreeMap::new();
        let before = previous
            .get(object_id)
            .and_then(|o| o.as_map())
            .map(|m| m.entries())
            .unwrap_or(&empty);

        let keys: BTreeSet<&String> = before.keys().chain(after.entries().keys()).collect();
        let mut changes = BTreeMap::new();
        for key in keys {
            let was = before
                .get(key)
                .filter(|e| !e.reference().is_some_and(|r| tombstoned_before(r)));
            let now = after
                .entry(key)
                .filter(|e| !e.reference().is_some_and(|r| tombstoned_after(r)));
            if let Some(change) = liveobjects_core::diff_entry(was, now) {
                changes.insert(key.clone(), change);
            }
        }

        let update = updates
            .entry(object_id.clone())
            .or_insert_with(|| ObjectUpdate::map(object_id.clone(), BTreeMap::new()));
        update.kind = UpdateKind::Map(changes);
    }
}
