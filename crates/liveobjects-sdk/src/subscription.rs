//! Per-object listener registries.

use liveobjects_core::{ObjectId, ObjectUpdate};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Callback invoked with every visible change to an object.
pub type Listener = Arc<dyn Fn(&ObjectUpdate) + Send + Sync>;

/// Ordered listeners of a single object.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Listener)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until unsubscribed; dropping
    /// the returned handle does not remove it.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&ObjectUpdate) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn unsubscribe_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deliver an update to every listener registered when delivery starts.
    ///
    /// A panicking listener is logged and skipped. Returns how many listeners
    /// failed.
    pub fn notify(&self, update: &ObjectUpdate) -> usize {
        let snapshot: Vec<(u64, Listener)> = self.entries.read().clone();

        let mut failed = 0;
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                failed += 1;
                warn!(
                    object_id = %update.object_id,
                    listener = id,
                    "Listener panicked while handling an update"
                );
            }
        }
        failed
    }
}

/// Handle returned by `subscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.listeners
            .upgrade()
            .map(|listeners| listeners.unsubscribe(self.id))
            .unwrap_or(false)
    }
}

/// Listener registries for every object, kept apart from object state so
/// subscriptions survive a sync replacing the object graph.
#[derive(Default)]
pub struct ListenerRegistry {
    registries: RwLock<HashMap<ObjectId, Arc<Listeners>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for `object_id`, created on first use.
    pub fn for_object(&self, object_id: &ObjectId) -> Arc<Listeners> {
        if let Some(existing) = self.registries.read().get(object_id) {
            return existing.clone();
        }
        self.registries
            .write()
            .entry(object_id.clone())
            .or_default()
            .clone()
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<Arc<Listeners>> {
        self.registries.read().get(object_id).cloned()
    }

    /// Drop the registry of an evicted object.
    pub fn remove(&self, object_id: &ObjectId) {
        self.registries.write().remove(object_id);
    }

    /// Deliver each update to its object's listeners, in order.
    pub fn dispatch(&self, updates: &[ObjectUpdate]) {
        for update in updates {
            if let Some(listeners) = self.get(&update.object_id) {
                listeners.notify(update);
            }
        }
    }
}
