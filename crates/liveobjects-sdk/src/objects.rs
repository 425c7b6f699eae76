//! The `LiveObjects` engine facade.

use crate::channel::{ChannelState, ObjectsChannel};
use crate::config::ObjectsConfig;
use crate::error::{ObjectsError, Result};
use crate::gc::GcReport;
use crate::handles::{LiveCounter, LiveMap};
use crate::pipeline::{now_ms, ObjectsEvent, Pipeline, SyncState};
use crate::pool::ObjectsPool;
use liveobjects_core::{
    CounterState, MapEntry, MapSemantics, MapState, ObjectData, ObjectId, ObjectKind,
    ObjectMessage, ObjectOperation, ObjectState,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use ulid::Ulid;

/// Live objects of one channel.
///
/// Inbound traffic is pushed in by the channel layer through
/// [`handle_object_messages`](Self::handle_object_messages),
/// [`on_sync_page`](Self::on_sync_page) and
/// [`on_channel_state`](Self::on_channel_state). Writes are published to
/// the channel and take effect only when their echo comes back through the
/// same inbound path.
///
/// # Example
///
/// ```rust
/// use liveobjects_sdk::{ChannelState, LiveObjects, MemoryHub, ObjectsConfig};
///
/// # tokio_test::block_on(async {
/// let hub = MemoryHub::new("game");
/// let channel = hub.connect("site-a");
/// let objects = LiveObjects::new(channel, ObjectsConfig::default());
/// objects.on_channel_state(ChannelState::Attached { has_objects: false });
///
/// let root = objects.get_root().await.unwrap();
/// root.set("name", "Alice").await.unwrap();
///
/// // Nothing changes until the echo arrives.
/// assert_eq!(root.size(), 0);
/// objects.handle_object_messages(objects.channel().drain()).unwrap();
/// assert_eq!(root.size(), 1);
/// # });
/// ```
pub struct LiveObjects<C: ObjectsChannel> {
    pipeline: Arc<Pipeline>,
    channel: Arc<C>,
}

impl<C: ObjectsChannel> Clone for LiveObjects<C> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            channel: self.channel.clone(),
        }
    }
}

impl<C: ObjectsChannel> LiveObjects<C> {
    pub fn new(channel: C, config: ObjectsConfig) -> Self {
        Self::with_channel(Arc::new(channel), config)
    }

    pub fn with_channel(channel: Arc<C>, config: ObjectsConfig) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(config)),
            channel,
        }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn config(&self) -> &ObjectsConfig {
        self.pipeline.config()
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The underlying object graph, for inspection.
    pub fn pool(&self) -> &ObjectsPool {
        self.pipeline.pool()
    }

    /// Deliver decoded messages in channel order. An error means state
    /// messages in the batch formed a snapshot that was rejected, and the
    /// channel should re-attach.
    pub fn handle_object_messages(&self, messages: Vec<ObjectMessage>) -> Result<()> {
        self.pipeline.handle_object_messages(messages)
    }

    /// Deliver one page of a sync sequence. An error means the completed
    /// snapshot was rejected and the channel should re-attach.
    pub fn on_sync_page(&self, sync_serial: &str, states: Vec<ObjectState>) -> Result<()> {
        self.pipeline.on_sync_page(sync_serial, states)
    }

    /// Deliver a complete snapshot in one piece.
    pub fn on_sync_snapshot(&self, states: Vec<ObjectState>) -> Result<()> {
        self.pipeline.on_sync_snapshot(states)
    }

    pub fn on_channel_state(&self, state: ChannelState) {
        self.pipeline.on_channel_state(state);
    }

    pub fn channel_state(&self) -> ChannelState {
        self.pipeline.channel_state()
    }

    pub fn sync_state(&self) -> SyncState {
        self.pipeline.sync_state()
    }

    /// Subscribe to sync lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ObjectsEvent> {
        self.pipeline.events()
    }

    /// The root map, once the current sync has completed.
    pub async fn get_root(&self) -> Result<LiveMap<C>> {
        let mut sync_state = self.pipeline.watch_sync_state();
        sync_state
            .wait_for(|state| *state == SyncState::Synced)
            .await
            .map_err(|_| ObjectsError::Closed)?;
        Ok(self.root())
    }

    /// The root map without waiting for sync.
    pub fn root(&self) -> LiveMap<C> {
        LiveMap::new(ObjectId::root(), self.clone())
    }

    pub fn get_map(&self, object_id: &ObjectId) -> Result<LiveMap<C>> {
        self.pipeline.pool().get_typed(object_id, ObjectKind::Map)?;
        Ok(LiveMap::new(object_id.clone(), self.clone()))
    }

    pub fn get_counter(&self, object_id: &ObjectId) -> Result<LiveCounter<C>> {
        self.pipeline.pool().get_typed(object_id, ObjectKind::Counter)?;
        Ok(LiveCounter::new(object_id.clone(), self.clone()))
    }

    /// Publish a `MapCreate` and return a handle to the new map. The map
    /// reads as empty until the create operation is echoed back.
    pub async fn create_map<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<LiveMap<C>>
    where
        K: Into<String>,
        V: Into<ObjectData>,
    {
        let mut initial = MapState {
            semantics: MapSemantics::Lww,
            ..Default::default()
        };
        for (key, value) in entries {
            let data = value.into();
            data.validate()
                .map_err(|e| ObjectsError::InvalidValue(e.to_string()))?;
            initial.entries.insert(key.into(), MapEntry::live(data, None));
        }

        let initial_value = serde_json::to_string(&initial)?;
        let nonce = nonce();
        let object_id = ObjectId::derive(ObjectKind::Map, &initial_value, &nonce, now_ms());
        self.publish(ObjectOperation::map_create(
            object_id.clone(),
            initial,
            nonce,
            initial_value,
        ))
        .await?;
        Ok(LiveMap::new(object_id, self.clone()))
    }

    /// Publish a `CounterCreate` and return a handle to the new counter.
    pub async fn create_counter(&self, count: f64) -> Result<LiveCounter<C>> {
        if !count.is_finite() {
            return Err(ObjectsError::InvalidValue(format!(
                "counter initial value must be finite, got {}",
                count
            )));
        }
        let initial = CounterState { count };
        let initial_value = serde_json::to_string(&initial)?;
        let nonce = nonce();
        let object_id = ObjectId::derive(ObjectKind::Counter, &initial_value, &nonce, now_ms());
        self.publish(ObjectOperation::counter_create(
            object_id.clone(),
            initial,
            nonce,
            initial_value,
        ))
        .await?;
        Ok(LiveCounter::new(object_id, self.clone()))
    }

    /// Run one garbage collection pass against `now_ms`.
    pub fn collect_garbage(&self, now_ms: i64) -> GcReport {
        self.pipeline.collect_garbage(now_ms)
    }

    /// Run garbage collection every `gc_interval_ms` until the engine is
    /// dropped.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let pipeline = Arc::downgrade(&self.pipeline);
        let period = self.config().gc_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                let report = pipeline.collect_garbage(now_ms());
                trace!(
                    objects_evicted = report.objects_evicted,
                    entries_removed = report.entries_removed,
                    "Scheduled garbage collection"
                );
            }
        })
    }

    /// Validate and hand an operation to the channel.
    pub(crate) async fn publish(&self, operation: ObjectOperation) -> Result<()> {
        operation.validate()?;
        let state = self.channel_state();
        if !state.is_usable() {
            return Err(ObjectsError::ChannelState { state });
        }

        let mut msg = ObjectMessage::from_operation(operation);
        msg.id = Some(Ulid::new().to_string());
        msg.client_id = self.config().client_id.clone();
        debug!(
            channel = self.channel.name(),
            id = ?msg.id,
            "Publishing object operation"
        );

        self.channel
            .publish(vec![msg])
            .await
            .map_err(|e| ObjectsError::Publish(e.to_string()))
    }
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
