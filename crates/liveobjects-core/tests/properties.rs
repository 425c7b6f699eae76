//! Property-based tests for the merge rules.
//!
//! These check the properties convergence depends on:
//!  - Idempotence: re-delivering messages changes nothing
//!  - Interleaving independence: any delivery order that keeps each site's
//!    own messages in order yields the same state
//!  - LWW determinism: the higher timeserial wins a key regardless of arrival
//!  - Counter additivity: increments sum in any order

use liveobjects_core::{
    ApplyOutcome, LiveObject, ObjectData, ObjectId, ObjectKind, ObjectMessage, ObjectOperation,
};
use proptest::prelude::*;
use std::collections::VecDeque;

const SITES: usize = 3;

#[derive(Clone, Debug)]
enum Op {
    Set(&'static str, i64),
    Remove(&'static str),
    Inc(i32),
}

fn counter_id() -> ObjectId {
    ObjectId::new("counter:shared@1")
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = prop_oneof![Just("a"), Just("b"), Just("c")];
    prop_oneof![
        (key.clone(), -50i64..50).prop_map(|(k, v)| Op::Set(k, v)),
        key.prop_map(Op::Remove),
        (-100i32..100).prop_map(Op::Inc),
    ]
}

/// Operations in issue order, each tagged with its originating site.
fn history_strategy() -> impl Strategy<Value = Vec<(usize, Op)>> {
    prop::collection::vec((0..SITES, op_strategy()), 0..40)
}

/// Serials are issued from one global sequence, so they increase per site and
/// never collide across sites.
fn message(index: usize, site: usize, op: &Op) -> ObjectMessage {
    let operation = match op {
        Op::Set(key, value) => {
            ObjectOperation::map_set(ObjectId::root(), *key, ObjectData::from(*value))
        }
        Op::Remove(key) => ObjectOperation::map_remove(ObjectId::root(), *key),
        Op::Inc(amount) => ObjectOperation::counter_inc(counter_id(), f64::from(*amount)),
    };
    ObjectMessage::from_operation(operation)
        .with_origin(format!("site-{}", site), format!("{:06}", index))
        .with_timestamp(index as i64)
}

/// Build a delivery order that keeps per-site order but interleaves sites
/// according to `picks`.
fn interleave(history: &[(usize, Op)], picks: &[usize]) -> Vec<usize> {
    let mut queues: Vec<VecDeque<usize>> = vec![VecDeque::new(); SITES];
    for (index, (site, _)) in history.iter().enumerate() {
        queues[*site].push_back(index);
    }

    let mut picks = picks.iter().cycle();
    let mut order = Vec::with_capacity(history.len());
    while order.len() < history.len() {
        let ready: Vec<usize> = (0..SITES).filter(|s| !queues[*s].is_empty()).collect();
        let pick = picks.next().copied().unwrap_or(0) % ready.len();
        if let Some(index) = queues[ready[pick]].pop_front() {
            order.push(index);
        }
    }
    order
}

struct Replica {
    root: LiveObject,
    counter: LiveObject,
}

impl Replica {
    fn new() -> Self {
        Self {
            root: LiveObject::zero_value(ObjectId::root(), ObjectKind::Map),
            counter: LiveObject::zero_value(counter_id(), ObjectKind::Counter),
        }
    }

    fn deliver(&mut self, msg: &ObjectMessage) -> ApplyOutcome {
        let op = msg.operation.as_ref().unwrap();
        let target = if op.object_id.is_root() {
            &mut self.root
        } else {
            &mut self.counter
        };
        target.apply_operation(op, msg).unwrap()
    }

    fn replay(history: &[(usize, Op)], order: &[usize]) -> Self {
        let mut replica = Self::new();
        for &index in order {
            let (site, op) = &history[index];
            replica.deliver(&message(index, *site, op));
        }
        replica
    }
}

proptest! {
    #[test]
    fn redelivery_is_idempotent(history in history_strategy()) {
        let order: Vec<usize> = (0..history.len()).collect();
        let once = Replica::replay(&history, &order);

        let mut twice = Replica::replay(&history, &order);
        for &index in &order {
            let (site, op) = &history[index];
            let outcome = twice.deliver(&message(index, *site, op));
            prop_assert_eq!(outcome, ApplyOutcome::Stale);
        }

        prop_assert_eq!(&once.root, &twice.root);
        prop_assert_eq!(&once.counter, &twice.counter);
    }

    #[test]
    fn site_interleaving_does_not_change_outcome(
        history in history_strategy(),
        picks in prop::collection::vec(0usize..SITES, 1..40)
    ) {
        let issue_order: Vec<usize> = (0..history.len()).collect();
        let reference = Replica::replay(&history, &issue_order);

        let shuffled = interleave(&history, &picks);
        let replica = Replica::replay(&history, &shuffled);

        prop_assert_eq!(reference.root.as_map(), replica.root.as_map());
        prop_assert_eq!(reference.counter.as_counter(), replica.counter.as_counter());
    }

    #[test]
    fn higher_timeserial_wins_key(
        first in -100i64..100,
        second in -100i64..100,
        t1 in 1usize..500,
        gap in 1usize..500
    ) {
        let t2 = t1 + gap;
        let older = message(t1, 0, &Op::Set("k", first));
        let newer = message(t2, 1, &Op::Set("k", second));

        for order in [[&older, &newer], [&newer, &older]] {
            let mut replica = Replica::new();
            for msg in order {
                replica.deliver(msg);
            }
            prop_assert_eq!(
                replica.root.as_map().unwrap().get("k"),
                Some(&ObjectData::from(second))
            );
        }
    }

    #[test]
    fn counter_increments_add_up(a in -1000i32..1000, b in -1000i32..1000) {
        let inc_a = message(1, 0, &Op::Inc(a));
        let inc_b = message(2, 1, &Op::Inc(b));

        for order in [[&inc_a, &inc_b], [&inc_b, &inc_a]] {
            let mut replica = Replica::new();
            for msg in order {
                replica.deliver(msg);
            }
            prop_assert_eq!(
                replica.counter.as_counter().unwrap().value(),
                f64::from(a) + f64::from(b)
            );
        }
    }
}

#[test]
fn stale_operation_from_same_site_is_a_normal_outcome() {
    let mut replica = Replica::new();
    let v2 = message(2, 0, &Op::Set("k", 2));
    let v1 = message(1, 0, &Op::Set("k", 1));

    assert!(matches!(replica.deliver(&v2), ApplyOutcome::Applied(Some(_))));
    assert_eq!(replica.deliver(&v1), ApplyOutcome::Stale);
    assert_eq!(
        replica.root.as_map().unwrap().get("k"),
        Some(&ObjectData::from(2i64))
    );
}
