//! LWW map data.
//!
//! Every key is an independent last-writer-wins register ordered by the
//! timeserial of the operation that last wrote it. Removals leave a tombstoned
//! entry behind so that a late, older `MapSet` cannot resurrect the key.

use crate::data::{MapEntry, ObjectData};
use crate::message::{MapSemantics, MapState};
use crate::timeserial::{is_newer, Timeserial};
use crate::update::{diff_entry, MapChange};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveMapData {
    semantics: MapSemantics,
    entries: BTreeMap<String, MapEntry>,
}

impl LiveMapData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tombstoned entries without a removal time are stamped with `at_ms`, so
    /// the grace period for garbage collection starts on arrival.
    pub fn from_state(state: &MapState, at_ms: i64) -> Self {
        let mut entries = state.entries.clone();
        for entry in entries.values_mut().filter(|e| e.tombstone) {
            entry.tombstoned_at.get_or_insert(at_ms);
        }
        Self {
            semantics: state.semantics,
            entries,
        }
    }

    pub fn semantics(&self) -> MapSemantics {
        self.semantics
    }

    /// All entries, tombstoned ones included.
    pub fn entries(&self) -> &BTreeMap<String, MapEntry> {
        &self.entries
    }

    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Visible value of a key, ignoring references to other objects' state.
    pub fn get(&self, key: &str) -> Option<&ObjectData> {
        self.entries
            .get(key)
            .filter(|e| e.is_visible())
            .and_then(|e| e.data.as_ref())
    }

    fn can_write(&self, key: &str, serial: Option<&Timeserial>) -> bool {
        match self.entries.get(key) {
            Some(existing) => is_newer(serial, existing.timeserial.as_ref()),
            None => true,
        }
    }

    /// Apply a `MapSet`. Returns the visible change, if the write won and
    /// changed what readers see.
    pub fn apply_set(
        &mut self,
        key: &str,
        data: ObjectData,
        serial: Option<&Timeserial>,
    ) -> Option<MapChange> {
        if !self.can_write(key, serial) {
            return None;
        }
        let next = MapEntry::live(data, serial.cloned());
        let previous = self.entries.insert(key.to_string(), next);
        diff_entry(previous.as_ref(), self.entries.get(key))
    }

    /// Apply a `MapRemove`, tombstoning the key at `at_ms`.
    pub fn apply_remove(
        &mut self,
        key: &str,
        serial: Option<&Timeserial>,
        at_ms: i64,
    ) -> Option<MapChange> {
        if !self.can_write(key, serial) {
            return None;
        }
        let next = MapEntry::removed(serial.cloned(), at_ms);
        let previous = self.entries.insert(key.to_string(), next);
        diff_entry(previous.as_ref(), self.entries.get(key))
    }

    /// Merge an initial state (from a create operation) through the per-key
    /// LWW rule, using each entry's own serial.
    pub fn merge_initial(&mut self, initial: &MapState, at_ms: i64) -> BTreeMap<String, MapChange> {
        let mut changes = BTreeMap::new();
        for (key, entry) in &initial.entries {
            let change = match (&entry.data, entry.tombstone) {
                (Some(data), false) => self.apply_set(key, data.clone(), entry.timeserial.as_ref()),
                _ => self.apply_remove(
                    key,
                    entry.timeserial.as_ref(),
                    entry.tombstoned_at.unwrap_or(at_ms),
                ),
            };
            if let Some(change) = change {
                changes.insert(key.clone(), change);
            }
        }
        changes
    }

    /// Drop tombstoned entries removed at or before `cutoff_ms`.
    pub fn remove_tombstones_before(&mut self, cutoff_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.tombstone && entry.tombstoned_at.is_some_and(|at| at <= cutoff_ms))
        });
        before - self.entries.len()
    }

    pub fn to_state(&self) -> MapState {
        MapState {
            semantics: self.semantics,
            entries: self.entries.clone(),
        }
    }
}
