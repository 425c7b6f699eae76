//! Counter data.
//!
//! A counter is a float accumulator mutated only by commutative addition, so
//! increments converge in any order. Duplicate delivery is filtered upstream by
//! the site gate, not here.

use crate::message::CounterState;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveCounterData {
    count: f64,
}

impl LiveCounterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: &CounterState) -> Self {
        Self { count: state.count }
    }

    pub fn value(&self) -> f64 {
        self.count
    }

    /// Add `amount`, returning the delta that was applied.
    pub fn increment(&mut self, amount: f64) -> f64 {
        self.count += amount;
        amount
    }

    pub fn to_state(&self) -> CounterState {
        CounterState { count: self.count }
    }
}
