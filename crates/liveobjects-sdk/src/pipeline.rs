//! The operation apply pipeline.
//!
//! Every inbound message, sync page and channel state change funnels through
//! [`Pipeline`]. Processing is serialized by the pipeline's state lock; the
//! per-object locks in the pool only ever guard one object at a time, and
//! listeners are invoked after every lock has been released.

use crate::channel::ChannelState;
use crate::config::ObjectsConfig;
use crate::error::Result;
use crate::gc::{self, GcReport};
use crate::pool::ObjectsPool;
use crate::subscription::ListenerRegistry;
use crate::sync::{apply_snapshot, SyncCoordinator};
use liveobjects_core::{
    ApplyOutcome, MapChange, MapEntry, ObjectId, ObjectMessage, ObjectOperation,
    ObjectOperationAction, ObjectState, ObjectUpdate, UpdateKind,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

/// Whether the local graph reflects a completed sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Initialized,
    Syncing,
    Synced,
}

/// Lifecycle events of the objects engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectsEvent {
    Syncing,
    Synced,
    SyncFailed { reason: String },
}

struct PipelineState {
    channel_state: ChannelState,
    sync: SyncCoordinator,
    /// Sync state to fall back to if the current sequence is abandoned.
    resume_state: SyncState,
    buffered: Vec<ObjectMessage>,
}

pub struct Pipeline {
    pool: ObjectsPool,
    listeners: ListenerRegistry,
    state: Mutex<PipelineState>,
    config: ObjectsConfig,
    sync_state: watch::Sender<SyncState>,
    events: broadcast::Sender<ObjectsEvent>,
}

impl Pipeline {
    pub fn new(config: ObjectsConfig) -> Self {
        let (sync_state, _) = watch::channel(SyncState::Initialized);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            pool: ObjectsPool::new(),
            listeners: ListenerRegistry::new(),
            state: Mutex::new(PipelineState {
                channel_state: ChannelState::Initialized,
                sync: SyncCoordinator::new(),
                resume_state: SyncState::Initialized,
                buffered: Vec::new(),
            }),
            config,
            sync_state,
            events,
        }
    }

    pub fn pool(&self) -> &ObjectsPool {
        &self.pool
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn config(&self) -> &ObjectsConfig {
        &self.config
    }

    pub fn channel_state(&self) -> ChannelState {
        self.state.lock().channel_state
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync_state.borrow()
    }

    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync_state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ObjectsEvent> {
        self.events.subscribe()
    }

    /// Handle a batch of inbound messages in channel order.
    ///
    /// State messages in the batch are committed first as one complete sync.
    /// Operations are applied one by one; a rejected operation is logged and
    /// does not stop the rest of the batch.
    ///
    /// An error means the inline snapshot was rejected and the channel should
    /// re-attach. The batch's operations have still been applied.
    pub fn handle_object_messages(&self, messages: Vec<ObjectMessage>) -> Result<()> {
        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let (states, operations): (Vec<_>, Vec<_>) = messages
                .into_iter()
                .partition(|msg| msg.object_state.is_some());

            let mut result = Ok(());
            if !states.is_empty() {
                let states = states.into_iter().filter_map(|m| m.object_state).collect();
                self.begin_sync(&mut state);
                state.sync.abort();
                result = self.commit_sync(&mut state, states, &mut updates);
            }

            for msg in operations {
                self.route_operation(&mut state, msg, &mut updates);
            }
            result
        };
        self.listeners.dispatch(&updates);
        result
    }

    /// Accept one page of a sync sequence. The snapshot is applied when the
    /// page's cursor is empty.
    pub fn on_sync_page(&self, sync_serial: &str, states: Vec<ObjectState>) -> Result<()> {
        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if !state.channel_state.is_usable() {
                debug!(
                    sync_serial,
                    channel_state = ?state.channel_state,
                    "Dropping sync page received while channel is not attached"
                );
                return Ok(());
            }
            self.begin_sync(&mut state);
            match state.sync.add_page(sync_serial, states) {
                Some(complete) => self.commit_sync(&mut state, complete, &mut updates),
                None => Ok(()),
            }
        };
        self.listeners.dispatch(&updates);
        result
    }

    /// Apply a complete snapshot delivered in one piece.
    pub fn on_sync_snapshot(&self, states: Vec<ObjectState>) -> Result<()> {
        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.begin_sync(&mut state);
            state.sync.abort();
            self.commit_sync(&mut state, states, &mut updates)
        };
        self.listeners.dispatch(&updates);
        result
    }

    pub fn on_channel_state(&self, channel_state: ChannelState) {
        let mut updates = Vec::new();
        {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.channel_state, channel_state);
            debug!(?previous, current = ?channel_state, "Channel state changed");

            match channel_state {
                ChannelState::Attached { has_objects: true } => self.begin_sync(&mut state),
                ChannelState::Attached { has_objects: false } => {
                    self.begin_sync(&mut state);
                    state.sync.abort();
                    let _ = self.commit_sync(&mut state, Vec::new(), &mut updates);
                }
                ChannelState::Suspended | ChannelState::Detached | ChannelState::Failed => {
                    if state.sync.abort() {
                        debug!("Discarding partially received sync");
                        self.sync_state.send_replace(state.resume_state);
                    }
                    let dropped = std::mem::take(&mut state.buffered).len();
                    if dropped > 0 {
                        debug!(dropped, "Dropped operations buffered during sync");
                    }
                }
                ChannelState::Initialized | ChannelState::Attaching => {}
            }
        }
        self.listeners.dispatch(&updates);
    }

    /// Evict tombstoned objects and entries past the grace period.
    pub fn collect_garbage(&self, now_ms: i64) -> GcReport {
        let _state = self.state.lock();
        let grace_ms = i64::try_from(self.config.gc_grace_period_ms).unwrap_or(i64::MAX);
        let report = gc::collect(&self.pool, grace_ms, now_ms);
        for object_id in &report.evicted {
            self.listeners.remove(object_id);
        }
        report
    }

    fn begin_sync(&self, state: &mut PipelineState) {
        if !state.sync.begin() {
            return;
        }
        let current = self.sync_state();
        if current != SyncState::Syncing {
            state.resume_state = current;
        }
        debug!("Sync sequence started");
        self.sync_state.send_replace(SyncState::Syncing);
        let _ = self.events.send(ObjectsEvent::Syncing);
    }

    fn commit_sync(
        &self,
        state: &mut PipelineState,
        states: Vec<ObjectState>,
        updates: &mut Vec<ObjectUpdate>,
    ) -> Result<()> {
        let now = now_ms();
        let result = apply_snapshot(&self.pool, &states, now);
        match &result {
            Ok(changes) => {
                info!(
                    objects = states.len(),
                    changed = changes.len(),
                    "Sync committed"
                );
                updates.extend(changes.iter().cloned());
                self.sync_state.send_replace(SyncState::Synced);
                let _ = self.events.send(ObjectsEvent::Synced);
            }
            Err(e) => {
                warn!(error = %e, "Rejected sync; keeping previous object graph");
                self.sync_state.send_replace(state.resume_state);
                let _ = self.events.send(ObjectsEvent::SyncFailed {
                    reason: e.to_string(),
                });
            }
        }

        let buffered = std::mem::take(&mut state.buffered);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "Applying operations buffered during sync");
        }
        for msg in &buffered {
            self.apply_operation(msg, now, updates);
        }

        result.map(|_| ())
    }

    fn route_operation(
        &self,
        state: &mut PipelineState,
        msg: ObjectMessage,
        updates: &mut Vec<ObjectUpdate>,
    ) {
        if !state.channel_state.is_usable() {
            debug!(
                channel_state = ?state.channel_state,
                serial = ?msg.serial,
                "Dropping operation received while channel is not attached"
            );
            return;
        }
        if state.sync.is_syncing() && self.config.buffer_operations_during_sync {
            trace!(serial = ?msg.serial, "Buffering operation until sync completes");
            state.buffered.push(msg);
            return;
        }
        self.apply_operation(&msg, now_ms(), updates);
    }

    /// Apply one live operation, appending any visible changes to `updates`.
    fn apply_operation(&self, msg: &ObjectMessage, now_ms: i64, updates: &mut Vec<ObjectUpdate>) {
        let Some(op) = msg.operation.as_ref() else {
            warn!(id = ?msg.id, "Object message carries neither an operation nor a state");
            return;
        };
        if let Err(e) = op.validate() {
            warn!(object_id = %op.object_id, error = %e, "Rejected object operation");
            return;
        }
        let Some(kind) = op.action.target_kind().or_else(|| op.object_id.kind()) else {
            warn!(object_id = %op.object_id, "Cannot infer the variant of the target object");
            return;
        };

        let stamped;
        let msg = match msg.timestamp {
            Some(_) => msg,
            None => {
                stamped = msg.clone().with_timestamp(now_ms);
                &stamped
            }
        };

        for reference in referenced_objects(op) {
            if let Some(kind) = reference.kind() {
                self.pool.get_or_create(reference, kind);
            }
        }

        let cell = self.pool.get_or_create(&op.object_id, kind);
        let keys = affected_keys(op);
        let before: Vec<Option<MapEntry>> = {
            let object = cell.read();
            keys.iter()
                .map(|key| object.as_map().and_then(|m| m.entry(key)).cloned())
                .collect()
        };

        let outcome = cell.write().apply_operation(op, msg);
        let mut update = match outcome {
            Err(e) => {
                warn!(object_id = %op.object_id, error = %e, "Rejected object operation");
                return;
            }
            Ok(ApplyOutcome::Stale) => {
                trace!(
                    object_id = %op.object_id,
                    site_code = ?msg.site_code,
                    serial = ?msg.serial,
                    "Discarded stale operation"
                );
                return;
            }
            Ok(ApplyOutcome::Applied(None)) => {
                trace!(object_id = %op.object_id, action = ?op.action, "Operation changed nothing visible");
                return;
            }
            Ok(ApplyOutcome::Applied(Some(update))) => update,
        };

        if !update.tombstone {
            if let UpdateKind::Map(changes) = &mut update.kind {
                let after: Vec<Option<MapEntry>> = {
                    let object = cell.read();
                    keys.iter()
                        .map(|key| object.as_map().and_then(|m| m.entry(key)).cloned())
                        .collect()
                };
                changes.clear();
                for ((key, was), now) in keys.iter().zip(&before).zip(&after) {
                    if let Some(change) = self.pool.visible_change(was.as_ref(), now.as_ref()) {
                        changes.insert(key.clone(), change);
                    }
                }
            }
        }

        if update.tombstone {
            for (map_id, keys) in self.pool.referrers(&op.object_id) {
                let changes: BTreeMap<String, MapChange> =
                    keys.into_iter().map(|key| (key, MapChange::Removed)).collect();
                let mut cascade = ObjectUpdate::map(map_id, changes);
                cascade.client_id = msg.client_id.clone();
                cascade.connection_id = msg.connection_id.clone();
                updates.push(cascade);
            }
        }

        if !update.is_noop() || matches!(op.action, ObjectOperationAction::CounterInc) {
            updates.push(update);
        }
    }
}

/// Keys of the target map an operation can change.
fn affected_keys(op: &ObjectOperation) -> Vec<String> {
    match op.action {
        ObjectOperationAction::MapSet | ObjectOperationAction::MapRemove => {
            op.map_op.iter().map(|m| m.key.clone()).collect()
        }
        ObjectOperationAction::MapCreate => op
            .map
            .iter()
            .flat_map(|m| m.entries.keys().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Objects an operation points at, which get placeholders if unseen.
fn referenced_objects(op: &ObjectOperation) -> Vec<&ObjectId> {
    let from_set = op
        .map_op
        .iter()
        .filter_map(|m| m.data.as_ref())
        .filter_map(|d| d.object_id());
    let from_create = op
        .map
        .iter()
        .flat_map(|m| m.entries.values())
        .filter_map(|e| e.reference());
    from_set.chain(from_create).collect()
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
