//! Convergence tests for the Live Objects engine
//!
//! These tests drive one or more engines over the in-memory hub and verify
//! the merge, sync and notification behaviour end to end, including
//! redelivery and cross-site reordering.

use liveobjects_core::{
    CounterState, MapEntry, MapState, ObjectOperation, SiteTimeserials, Timeserial,
};
use liveobjects_sdk::prelude::*;
use liveobjects_sdk::{
    MemoryChannel, MemoryHub, ObjectId, ObjectMessage, ObjectState, ObjectsConfigBuilder,
    SyncState,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_test::{assert_pending, assert_ready_ok};

// ============================================================================
// Helpers
// ============================================================================

type Client = LiveObjects<MemoryChannel>;

fn attached(hub: &Arc<MemoryHub>, site: &str) -> Client {
    let objects = LiveObjects::new(hub.connect(site), ObjectsConfig::default());
    objects.on_channel_state(ChannelState::Attached { has_objects: false });
    objects
}

fn deliver(client: &Client) {
    client.handle_object_messages(client.channel().drain()).unwrap();
}

fn op(operation: ObjectOperation, site: &str, serial: &str) -> ObjectMessage {
    ObjectMessage::from_operation(operation)
        .with_origin(site, serial)
        .with_timestamp(1_000)
}

type Recorded = Arc<Mutex<Vec<ObjectUpdate>>>;

fn recorder() -> (Recorded, impl Fn(&ObjectUpdate) + Send + Sync + 'static) {
    let updates: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    (updates, move |update: &ObjectUpdate| sink.lock().push(update.clone()))
}

fn map_state(id: &str, serials: &[(&str, &str)], entries: &[(&str, ObjectData)]) -> ObjectState {
    ObjectState {
        object_id: ObjectId::new(id),
        site_timeserials: SiteTimeserials::from_entries(serials.iter().copied()),
        tombstone: false,
        create_op: None,
        map: Some(MapState {
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), MapEntry::live(v.clone(), Some("01".into()))))
                .collect(),
            ..Default::default()
        }),
        counter: None,
    }
}

fn sorted_states(client: &Client) -> Vec<ObjectState> {
    let mut states: Vec<ObjectState> = client
        .pool()
        .cells()
        .into_iter()
        .map(|cell| cell.read().to_state())
        .collect();
    states.sort_by(|a, b| a.object_id.cmp(&b.object_id));
    states
}

// ============================================================================
// Merge scenarios
// ============================================================================

#[tokio::test]
async fn test_same_site_sets_emit_one_event_each() {
    let hub = MemoryHub::new("scenarios");
    let client = attached(&hub, "local");
    let (updates, listener) = recorder();
    let root = client.root();
    root.subscribe(listener);

    client.handle_object_messages(vec![op(
        ObjectOperation::map_set(ObjectId::root(), "k", "first".into()),
        "remote",
        "1",
    )]).unwrap();
    client.handle_object_messages(vec![op(
        ObjectOperation::map_set(ObjectId::root(), "k", "second".into()),
        "remote",
        "2",
    )]).unwrap();

    assert_eq!(root.get("k").unwrap().as_data(), Some(&ObjectData::from("second")));
    let updates = updates.lock();
    assert_eq!(updates.len(), 2);
    for update in updates.iter() {
        assert_eq!(update.map_changes().unwrap().get("k"), Some(&MapChange::Updated));
    }
}

#[tokio::test]
async fn test_remove_of_unset_key_is_silent() {
    let hub = MemoryHub::new("scenarios");
    let client = attached(&hub, "local");
    let (updates, listener) = recorder();
    client.root().subscribe(listener);

    client.handle_object_messages(vec![op(
        ObjectOperation::map_remove(ObjectId::root(), "never"),
        "remote",
        "1",
    )]).unwrap();

    let root = client.pool().root();
    let root = root.read();
    let entry = root.as_map().unwrap().entry("never").unwrap();
    assert!(entry.tombstone);
    assert!(entry.data.is_none());
    assert_eq!(entry.timeserial, Some(Timeserial::from("1")));
    assert!(updates.lock().is_empty());
}

#[tokio::test]
async fn test_concurrent_increments_emit_deltas() {
    let hub = MemoryHub::new("scenarios");
    let client = attached(&hub, "local");
    let counter_id = ObjectId::new("counter:shared@1");

    client.handle_object_messages(vec![op(
        ObjectOperation::counter_create(counter_id.clone(), CounterState { count: 0.0 }, "n", "{}"),
        "site-a",
        "1",
    )]).unwrap();
    let counter = client.get_counter(&counter_id).unwrap();
    let (updates, listener) = recorder();
    counter.subscribe(listener);

    client.handle_object_messages(vec![
        op(ObjectOperation::counter_inc(counter_id.clone(), 5.0), "site-a", "2"),
        op(ObjectOperation::counter_inc(counter_id.clone(), 5.0), "site-b", "1"),
    ]).unwrap();

    assert_eq!(counter.value(), 10.0);
    let amounts: Vec<f64> = updates
        .lock()
        .iter()
        .filter_map(|u| u.counter_amount())
        .collect();
    assert_eq!(amounts, vec![5.0, 5.0]);
}

#[tokio::test]
async fn test_out_of_order_same_site_keeps_newer() {
    let hub = MemoryHub::new("scenarios");
    let client = attached(&hub, "local");

    client.handle_object_messages(vec![
        op(ObjectOperation::map_set(ObjectId::root(), "k", "v2".into()), "remote", "2"),
        op(ObjectOperation::map_set(ObjectId::root(), "k", "v1".into()), "remote", "1"),
    ]).unwrap();

    assert_eq!(
        client.root().get("k").unwrap().as_data(),
        Some(&ObjectData::from("v2"))
    );
}

#[tokio::test]
async fn test_redelivered_batch_changes_nothing() {
    let hub = MemoryHub::new("scenarios");
    let client = attached(&hub, "local");
    let batch = vec![
        op(ObjectOperation::map_set(ObjectId::root(), "a", 1i64.into()), "x", "1"),
        op(ObjectOperation::map_remove(ObjectId::root(), "b"), "y", "1"),
        op(ObjectOperation::counter_inc(ObjectId::new("counter:c@1"), 2.0), "x", "2"),
    ];

    client.handle_object_messages(batch.clone()).unwrap();
    let once = sorted_states(&client);

    let (updates, listener) = recorder();
    client.root().subscribe(listener);
    client.handle_object_messages(batch).unwrap();

    assert_eq!(sorted_states(&client), once);
    assert!(updates.lock().is_empty());
}

// ============================================================================
// Local writes
// ============================================================================

#[tokio::test]
async fn test_writes_apply_only_through_echo() {
    let hub = MemoryHub::new("echo");
    let alice = attached(&hub, "alice");
    let bob = attached(&hub, "bob");
    let (updates, listener) = recorder();
    alice.root().subscribe(listener);

    alice.root().set("greeting", "hello").await.unwrap();
    assert!(alice.root().get("greeting").is_none());
    assert!(updates.lock().is_empty());

    deliver(&alice);
    deliver(&bob);

    for client in [&alice, &bob] {
        assert_eq!(
            client.root().get("greeting").unwrap().as_data(),
            Some(&ObjectData::from("hello"))
        );
    }
    let updates = updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].connection_id.as_deref(), Some(alice.channel().connection_id()));
}

#[tokio::test]
async fn test_writes_rejected_while_suspended() {
    let hub = MemoryHub::new("suspend");
    let alice = attached(&hub, "alice");
    let bob = attached(&hub, "bob");

    bob.on_channel_state(ChannelState::Suspended);
    assert!(matches!(
        bob.root().set("k", "v").await,
        Err(ObjectsError::ChannelState { .. })
    ));

    alice.root().set("k", "from alice").await.unwrap();
    deliver(&bob);
    assert!(bob.root().get("k").is_none());

    // Re-attaching resyncs what was missed
    bob.on_channel_state(ChannelState::Attached { has_objects: true });
    bob.on_sync_snapshot(hub.snapshot()).unwrap();
    assert_eq!(
        bob.root().get("k").unwrap().as_data(),
        Some(&ObjectData::from("from alice"))
    );
}

#[test]
fn test_get_root_waits_for_sync() {
    let hub = MemoryHub::new("wait");
    let client = LiveObjects::new(hub.connect("a"), ObjectsConfig::default());

    let mut root = tokio_test::task::spawn(client.get_root());
    assert_pending!(root.poll());

    client.on_channel_state(ChannelState::Attached { has_objects: true });
    assert_pending!(root.poll());

    client.on_sync_page("seq:", hub.snapshot()).unwrap();
    let root = assert_ready_ok!(root.poll());
    assert!(root.object_id().is_root());
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn test_sync_overrides_site_serials() {
    let hub = MemoryHub::new("sync");
    let client = attached(&hub, "local");
    let set = op(ObjectOperation::map_set(ObjectId::root(), "k", "v".into()), "a", "05");
    client.handle_object_messages(vec![set.clone()]).unwrap();

    let snapshot = map_state("root", &[("b", "01")], &[]);
    client.on_sync_snapshot(vec![snapshot.clone()]).unwrap();

    let root = client.pool().root();
    assert_eq!(root.read().site_timeserials(), &snapshot.site_timeserials);
    assert!(client.root().get("k").is_none());

    // Serials from site "a" were discarded, so the same op applies again
    client.handle_object_messages(vec![set]).unwrap();
    assert!(client.root().get("k").is_some());
}

#[tokio::test]
async fn test_sync_omitting_object_tombstones_it() {
    let hub = MemoryHub::new("sync");
    let client = attached(&hub, "local");
    let child_id = ObjectId::new("map:child@1");

    client
        .on_sync_snapshot(vec![
            map_state("root", &[], &[("child", child_id.clone().into())]),
            map_state("map:child@1", &[], &[("x", "1".into())]),
        ])
        .unwrap();
    let child = client.get_map(&child_id).unwrap();
    assert_eq!(child.size(), 1);

    let (root_updates, root_listener) = recorder();
    let (child_updates, child_listener) = recorder();
    client.root().subscribe(root_listener);
    child.subscribe(child_listener);

    client
        .on_sync_snapshot(vec![map_state("root", &[], &[("child", child_id.clone().into())])])
        .unwrap();

    assert!(child.is_tombstoned());
    assert!(client.root().get("child").is_none());

    let root_updates = root_updates.lock();
    assert_eq!(root_updates.len(), 1);
    assert_eq!(
        root_updates[0].map_changes().unwrap().get("child"),
        Some(&MapChange::Removed)
    );
    let child_updates = child_updates.lock();
    assert_eq!(child_updates.len(), 1);
    assert!(child_updates[0].tombstone);
    assert_eq!(
        child_updates[0].map_changes().unwrap().get("x"),
        Some(&MapChange::Removed)
    );
}

#[tokio::test]
async fn test_malformed_sync_is_rejected_atomically() {
    let hub = MemoryHub::new("sync");
    let client = attached(&hub, "local");
    client.handle_object_messages(vec![op(
        ObjectOperation::map_set(ObjectId::root(), "k", "kept".into()),
        "a",
        "1",
    )]).unwrap();
    let before = sorted_states(&client);
    let mut events = client.events();

    let mut malformed = map_state("counter:bad@1", &[], &[]);
    malformed.counter = Some(CounterState { count: 1.0 });
    let result = client.on_sync_snapshot(vec![map_state("root", &[], &[]), malformed]);

    assert!(matches!(result, Err(ObjectsError::MalformedSync(_))));
    assert_eq!(sorted_states(&client), before);
    assert_eq!(events.recv().await.unwrap(), ObjectsEvent::Syncing);
    assert!(matches!(
        events.recv().await.unwrap(),
        ObjectsEvent::SyncFailed { .. }
    ));
}

#[tokio::test]
async fn test_late_joiner_syncs_in_pages() {
    let hub = MemoryHub::new("pages");
    let alice = attached(&hub, "alice");

    let counter = alice.create_counter(1.0).await.unwrap();
    let nested = alice.create_map([("inner", ObjectData::from(true))]).await.unwrap();
    alice.root().set("counter", &counter).await.unwrap();
    alice.root().set("nested", &nested).await.unwrap();
    alice.root().set("title", "pages").await.unwrap();
    counter.increment(4.0).await.unwrap();
    deliver(&alice);

    let bob = LiveObjects::new(hub.connect("bob"), ObjectsConfig::default());
    bob.on_channel_state(ChannelState::Attached { has_objects: true });
    let pages = hub.sync_pages("seq-1", 1);
    assert!(pages.len() > 1);

    let (last, first) = pages.split_last().unwrap();
    for (serial, states) in first {
        bob.on_sync_page(serial, states.clone()).unwrap();
        assert_eq!(bob.sync_state(), SyncState::Syncing);
    }
    bob.on_sync_page(&last.0, last.1.clone()).unwrap();
    assert_eq!(bob.sync_state(), SyncState::Synced);

    // The full log arrives afterwards and is entirely stale
    deliver(&bob);

    let root = bob.get_root().await.unwrap();
    assert_eq!(root.get("counter").unwrap().as_counter().unwrap().value(), 5.0);
    let nested = root.get("nested").unwrap();
    assert_eq!(
        nested.as_map().unwrap().get("inner").unwrap().as_data(),
        Some(&ObjectData::from(true))
    );
    assert_eq!(sorted_states(&bob), sorted_states(&alice));
}

#[tokio::test]
async fn test_operations_during_sync_are_buffered() {
    let hub = MemoryHub::new("buffer");
    let alice = attached(&hub, "alice");
    alice.root().set("before", 1i64).await.unwrap();

    let bob = LiveObjects::new(hub.connect("bob"), ObjectsConfig::default());
    bob.on_channel_state(ChannelState::Attached { has_objects: true });
    let snapshot = hub.snapshot();

    alice.root().set("during", 2i64).await.unwrap();
    deliver(&bob);
    assert!(bob.root().get("during").is_none());

    bob.on_sync_snapshot(snapshot).unwrap();
    assert_eq!(bob.root().get("before").unwrap().as_data(), Some(&ObjectData::from(1i64)));
    assert_eq!(bob.root().get("during").unwrap().as_data(), Some(&ObjectData::from(2i64)));
}

#[tokio::test]
async fn test_empty_channel_attach_clears_state() {
    let hub = MemoryHub::new("empty");
    let client = attached(&hub, "local");
    client.handle_object_messages(vec![
        op(ObjectOperation::map_set(ObjectId::root(), "k", "v".into()), "a", "1"),
        op(ObjectOperation::counter_inc(ObjectId::new("counter:c@1"), 1.0), "a", "2"),
    ]).unwrap();

    client.on_channel_state(ChannelState::Attached { has_objects: false });

    assert_eq!(client.root().size(), 0);
    assert!(client.pool().is_tombstoned(&ObjectId::new("counter:c@1")));
    assert_eq!(client.sync_state(), SyncState::Synced);
}

// ============================================================================
// Subscriptions and GC
// ============================================================================

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let hub = MemoryHub::new("listeners");
    let client = attached(&hub, "local");
    let root = client.root();

    root.subscribe(|_| panic!("listener failure"));
    let (updates, listener) = recorder();
    let subscription = root.subscribe(listener);

    root.set("k", "v").await.unwrap();
    deliver(&client);
    assert_eq!(updates.lock().len(), 1);
    assert!(root.get("k").is_some());

    assert!(subscription.unsubscribe());
    root.set("k", "w").await.unwrap();
    deliver(&client);
    assert_eq!(updates.lock().len(), 1);

    root.unsubscribe_all();
    root.set("k", "x").await.unwrap();
    deliver(&client);
}

#[tokio::test]
async fn test_gc_evicts_after_grace_period() {
    let hub = MemoryHub::new("gc");
    let config = ObjectsConfigBuilder::new().gc_grace_period(1_000).build();
    let client = LiveObjects::new(hub.connect("local"), config);
    client.on_channel_state(ChannelState::Attached { has_objects: false });

    let counter = client.create_counter(1.0).await.unwrap();
    deliver(&client);
    client.root().set("k", "v").await.unwrap();
    client.root().remove("k").await.unwrap();
    counter.delete().await.unwrap();
    deliver(&client);
    assert!(counter.is_tombstoned());

    let now = chrono::Utc::now().timestamp_millis();
    let early = client.collect_garbage(now - 10_000);
    assert_eq!(early.objects_evicted, 0);
    assert_eq!(early.entries_removed, 0);

    let report = client.collect_garbage(now + 2_000);
    assert_eq!(report.objects_evicted, 1);
    assert_eq!(report.entries_removed, 1);
    assert!(!client.pool().contains(counter.object_id()));
    assert_eq!(counter.value(), 0.0);
}

// ============================================================================
// Randomized convergence
// ============================================================================

/// Deliver `log` in an order that keeps each site's messages in order but
/// interleaves sites at random, re-sending some messages along the way.
fn shuffled_delivery(log: &[ObjectMessage], rng: &mut StdRng) -> Vec<ObjectMessage> {
    let mut queues: BTreeMap<String, VecDeque<ObjectMessage>> = BTreeMap::new();
    for msg in log {
        let site = msg.site_code.clone().unwrap_or_default();
        queues.entry(site).or_default().push_back(msg.clone());
    }

    let mut delivered: Vec<ObjectMessage> = Vec::new();
    while queues.values().any(|q| !q.is_empty()) {
        let ready: Vec<String> = queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(site, _)| site.clone())
            .collect();
        let site = &ready[rng.gen_range(0..ready.len())];
        if let Some(msg) = queues.get_mut(site).and_then(|q| q.pop_front()) {
            delivered.push(msg);
        }
        if !delivered.is_empty() && rng.gen_bool(0.2) {
            let duplicate = delivered[rng.gen_range(0..delivered.len())].clone();
            delivered.push(duplicate);
        }
    }
    delivered
}

#[tokio::test]
async fn test_random_interleavings_converge() {
    let mut rng = StdRng::seed_from_u64(20_241);
    let hub = MemoryHub::new("random");
    let clients: Vec<Client> = ["a", "b", "c"].iter().map(|s| attached(&hub, s)).collect();

    let counter = clients[0].create_counter(0.0).await.unwrap();
    clients[0].root().set("counter", &counter).await.unwrap();
    for client in &clients {
        deliver(client);
    }

    let keys = ["w", "x", "y", "z"];
    for step in 0..120 {
        let client = &clients[rng.gen_range(0..clients.len())];
        let root = client.root();
        let key = keys[rng.gen_range(0..keys.len())];
        match rng.gen_range(0..5) {
            0 | 1 => root.set(key, rng.gen_range(0..1_000i64)).await.unwrap(),
            2 => root.remove(key).await.unwrap(),
            3 => {
                let counter = client.get_counter(counter.object_id()).unwrap();
                counter.increment(f64::from(rng.gen_range(-10..10))).await.unwrap();
            }
            _ => {
                let child = client.create_map([("step", ObjectData::from(step as i64))]).await.unwrap();
                root.set(key, &child).await.unwrap();
            }
        }
    }

    let log = hub.messages();
    for client in &clients {
        client.handle_object_messages(shuffled_delivery(&log, &mut rng)).unwrap();
    }

    let reference = sorted_states(&clients[0]);
    for client in &clients[1..] {
        assert_eq!(sorted_states(client), reference);
    }
    assert_eq!(hub.snapshot(), reference);
}
