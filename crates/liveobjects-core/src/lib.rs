// File: `crates/liveobjects-core/src/lib.rs`
//! Object model and merge rules for Live Objects.
//!
//! Live objects are maps and counters replicated across every client attached
//! to a channel. Operations arrive over an at-least-once, possibly reordered
//! channel; convergence comes from two rules:
//!
//! - a per-object, per-site timeserial gate that drops duplicates and stale
//!   operations, and
//! - per-variant merge semantics: last-writer-wins per map key, commutative
//!   addition for counters.
//!
//! This crate is pure state: no I/O, no clocks, no locking.

pub mod counter;
pub mod data;
pub mod error;
pub mod map;
pub mod message;
pub mod object;
pub mod object_id;
pub mod timeserial;
pub mod update;

pub use counter::LiveCounterData;
pub use data::{MapEntry, ObjectData};
pub use error::{MergeError, Result};
pub use map::LiveMapData;
pub use message::{
    CounterOp, CounterState, MapOp, MapSemantics, MapState, ObjectMessage, ObjectOperation,
    ObjectOperationAction, ObjectState,
};
pub use object::{ApplyOutcome, LiveObject, ObjectValue};
pub use object_id::{ObjectId, ObjectKind, ROOT_OBJECT_ID};
pub use timeserial::{SiteTimeserials, Timeserial};
pub use update::{diff_entry, diff_map_entries, MapChange, ObjectUpdate, UpdateKind};
