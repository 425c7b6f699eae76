//! Tombstone garbage collection.
//!
//! Tombstoned objects and map entries are kept for a grace period so that
//! late, re-delivered operations still meet the site gate and per-key serial
//! instead of resurrecting deleted state. Once the grace period has passed
//! they are removed.

use crate::pool::ObjectsPool;
use liveobjects_core::ObjectId;
use std::collections::HashSet;
use tracing::debug;

/// Result of a collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Number of tombstoned objects evicted from the pool.
    pub objects_evicted: usize,

    /// Number of tombstoned map entries dropped.
    pub entries_removed: usize,

    /// Ids of the evicted objects.
    pub evicted: Vec<ObjectId>,
}

/// Collect everything tombstoned at or before `now_ms - grace_ms`.
///
/// An object is evicted only if no live map still holds an entry pointing at
/// it. The root is never evicted.
pub fn collect(pool: &ObjectsPool, grace_ms: i64, now_ms: i64) -> GcReport {
    let cutoff = now_ms.saturating_sub(grace_ms);
    let cells = pool.cells();

    let mut referenced: HashSet<ObjectId> = HashSet::new();
    let mut expired = Vec::new();
    for cell in &cells {
        let object = cell.read();
        referenced.extend(object.references().into_iter().cloned());
        if object.object_id().is_root() {
            continue;
        }
        if object.is_tombstoned() && object.tombstoned_at().is_some_and(|at| at <= cutoff) {
            expired.push(object.object_id().clone());
        }
    }

    let evicted: Vec<ObjectId> = expired
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();
    let objects_evicted = pool.evict(&evicted);

    let mut entries_removed = 0;
    for cell in &cells {
        let mut object = cell.write();
        if let Some(map) = object.as_map_mut() {
            entries_removed += map.remove_tombstones_before(cutoff);
        }
    }

    debug!(objects_evicted, entries_removed, "Garbage collection pass finished");
    GcReport {
        objects_evicted,
        entries_removed,
        evicted,
    }
}
