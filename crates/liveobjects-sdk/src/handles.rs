//! Application-facing handles to live maps and counters.
//!
//! A handle holds only an object id and the engine; every read resolves the
//! object from the pool at call time, so handles stay valid across a sync
//! that replaces the object graph.

use crate::channel::ObjectsChannel;
use crate::error::{ObjectsError, Result};
use crate::objects::LiveObjects;
use crate::pool::ObjectCell;
use crate::subscription::Subscription;
use liveobjects_core::{MapEntry, ObjectData, ObjectId, ObjectKind, ObjectOperation, ObjectUpdate};
use std::fmt;

/// A value read from a map: a primitive or a handle to another object.
pub enum MapValue<C: ObjectsChannel> {
    Primitive(ObjectData),
    Map(LiveMap<C>),
    Counter(LiveCounter<C>),
}

impl<C: ObjectsChannel> MapValue<C> {
    pub fn as_data(&self) -> Option<&ObjectData> {
        match self {
            MapValue::Primitive(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&LiveMap<C>> {
        match self {
            MapValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&LiveCounter<C>> {
        match self {
            MapValue::Counter(counter) => Some(counter),
            _ => None,
        }
    }
}

impl<C: ObjectsChannel> Clone for MapValue<C> {
    fn clone(&self) -> Self {
        match self {
            MapValue::Primitive(data) => MapValue::Primitive(data.clone()),
            MapValue::Map(map) => MapValue::Map(map.clone()),
            MapValue::Counter(counter) => MapValue::Counter(counter.clone()),
        }
    }
}

impl<C: ObjectsChannel> fmt::Debug for MapValue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapValue::Primitive(data) => f.debug_tuple("Primitive").field(data).finish(),
            MapValue::Map(map) => f.debug_tuple("Map").field(map.object_id()).finish(),
            MapValue::Counter(counter) => {
                f.debug_tuple("Counter").field(counter.object_id()).finish()
            }
        }
    }
}

/// Handle to a live map.
pub struct LiveMap<C: ObjectsChannel> {
    object_id: ObjectId,
    objects: LiveObjects<C>,
}

impl<C: ObjectsChannel> LiveMap<C> {
    pub(crate) fn new(object_id: ObjectId, objects: LiveObjects<C>) -> Self {
        Self { object_id, objects }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    fn cell(&self) -> Option<ObjectCell> {
        self.objects.pipeline().pool().get(&self.object_id)
    }

    pub fn is_tombstoned(&self) -> bool {
        self.objects.pipeline().pool().is_tombstoned(&self.object_id)
    }

    /// Visible entries, copied out so no object lock is held while checking
    /// referenced objects.
    fn visible_entries(&self) -> Vec<(String, ObjectData)> {
        let Some(cell) = self.cell() else {
            return Vec::new();
        };
        let entries: Vec<(String, MapEntry)> = {
            let object = cell.read();
            if object.is_tombstoned() {
                return Vec::new();
            }
            object
                .as_map()
                .map(|map| {
                    map.entries()
                        .iter()
                        .map(|(k, e)| (k.clone(), e.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let pool = self.objects.pipeline().pool();
        entries
            .into_iter()
            .filter(|(_, entry)| pool.entry_visible(entry))
            .filter_map(|(key, entry)| entry.data.map(|data| (key, data)))
            .collect()
    }

    fn resolve(&self, data: ObjectData) -> Option<MapValue<C>> {
        let Some(reference) = data.object_id() else {
            return Some(MapValue::Primitive(data));
        };
        let cell = self.objects.pipeline().pool().get(reference)?;
        let kind = cell.read().kind();
        let handle = match kind {
            ObjectKind::Map => MapValue::Map(LiveMap::new(reference.clone(), self.objects.clone())),
            ObjectKind::Counter => {
                MapValue::Counter(LiveCounter::new(reference.clone(), self.objects.clone()))
            }
        };
        Some(handle)
    }

    pub fn get(&self, key: &str) -> Option<MapValue<C>> {
        let entry = {
            let cell = self.cell()?;
            let object = cell.read();
            if object.is_tombstoned() {
                return None;
            }
            object.as_map()?.entry(key)?.clone()
        };
        if !self.objects.pipeline().pool().entry_visible(&entry) {
            return None;
        }
        self.resolve(entry.data?)
    }

    pub fn size(&self) -> usize {
        self.visible_entries().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.visible_entries().into_iter().map(|(k, _)| k).collect()
    }

    pub fn entries(&self) -> Vec<(String, MapValue<C>)> {
        self.visible_entries()
            .into_iter()
            .filter_map(|(key, data)| self.resolve(data).map(|value| (key, value)))
            .collect()
    }

    /// Publish a `MapSet`. Passing a `&LiveMap` or `&LiveCounter` stores a
    /// reference to that object.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<ObjectData>) -> Result<()> {
        let data = value.into();
        data.validate()
            .map_err(|e| ObjectsError::InvalidValue(e.to_string()))?;
        self.objects
            .publish(ObjectOperation::map_set(self.object_id.clone(), key, data))
            .await
    }

    pub async fn remove(&self, key: impl Into<String>) -> Result<()> {
        self.objects
            .publish(ObjectOperation::map_remove(self.object_id.clone(), key))
            .await
    }

    /// Publish an `ObjectDelete` for this map. The root cannot be deleted.
    pub async fn delete(&self) -> Result<()> {
        self.objects
            .publish(ObjectOperation::object_delete(self.object_id.clone()))
            .await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ObjectUpdate) + Send + Sync + 'static,
    {
        self.objects
            .pipeline()
            .listeners()
            .for_object(&self.object_id)
            .subscribe(listener)
    }

    pub fn unsubscribe_all(&self) {
        if let Some(listeners) = self.objects.pipeline().listeners().get(&self.object_id) {
            listeners.unsubscribe_all();
        }
    }
}

impl<C: ObjectsChannel> Clone for LiveMap<C> {
    fn clone(&self) -> Self {
        Self::new(self.object_id.clone(), self.objects.clone())
    }
}

impl<C: ObjectsChannel> fmt::Debug for LiveMap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveMap")
            .field("object_id", &self.object_id)
            .finish()
    }
}

impl<C: ObjectsChannel> From<&LiveMap<C>> for ObjectData {
    fn from(map: &LiveMap<C>) -> Self {
        ObjectData::ObjectId(map.object_id.clone())
    }
}

/// Handle to a live counter.
pub struct LiveCounter<C: ObjectsChannel> {
    object_id: ObjectId,
    objects: LiveObjects<C>,
}

impl<C: ObjectsChannel> LiveCounter<C> {
    pub(crate) fn new(object_id: ObjectId, objects: LiveObjects<C>) -> Self {
        Self { object_id, objects }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn is_tombstoned(&self) -> bool {
        self.objects.pipeline().pool().is_tombstoned(&self.object_id)
    }

    /// Current count. An unknown or deleted counter reads as zero.
    pub fn value(&self) -> f64 {
        self.objects
            .pipeline()
            .pool()
            .get(&self.object_id)
            .and_then(|cell| cell.read().as_counter().map(|c| c.value()))
            .unwrap_or(0.0)
    }

    pub async fn increment(&self, amount: f64) -> Result<()> {
        if !amount.is_finite() {
            return Err(ObjectsError::InvalidValue(format!(
                "counter amount must be finite, got {}",
                amount
            )));
        }
        self.objects
            .publish(ObjectOperation::counter_inc(self.object_id.clone(), amount))
            .await
    }

    pub async fn decrement(&self, amount: f64) -> Result<()> {
        self.increment(-amount).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.objects
            .publish(ObjectOperation::object_delete(self.object_id.clone()))
            .await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ObjectUpdate) + Send + Sync + 'static,
    {
        self.objects
            .pipeline()
            .listeners()
            .for_object(&self.object_id)
            .subscribe(listener)
    }

    pub fn unsubscribe_all(&self) {
        if let Some(listeners) = self.objects.pipeline().listeners().get(&self.object_id) {
            listeners.unsubscribe_all();
        }
    }
}

impl<C: ObjectsChannel> Clone for LiveCounter<C> {
    fn clone(&self) -> Self {
        Self::new(self.object_id.clone(), self.objects.clone())
    }
}

impl<C: ObjectsChannel> fmt::Debug for LiveCounter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCounter")
            .field("object_id", &self.object_id)
            .finish()
    }
}

impl<C: ObjectsChannel> From<&LiveCounter<C>> for ObjectData {
    fn from(counter: &LiveCounter<C>) -> Self {
        ObjectData::ObjectId(counter.object_id.clone())
    }
}
