//! Live Objects SDK - replicated maps and counters over a realtime channel
//!
//! This SDK keeps a graph of live objects (maps and counters) consistent
//! across every client attached to the same channel. Operations arrive over
//! an at-least-once, possibly reordered channel and are merged with the
//! rules in `liveobjects-core`; a full snapshot from the service replaces
//! local state whenever the channel (re)attaches.
//!
//! # Quick Start
//!
//! ```rust
//! use liveobjects_sdk::{ChannelState, LiveObjects, MemoryHub, ObjectsConfig};
//!
//! # tokio_test::block_on(async {
//! let hub = MemoryHub::new("scores");
//! let alice = LiveObjects::new(hub.connect("alice"), ObjectsConfig::default());
//! let bob = LiveObjects::new(hub.connect("bob"), ObjectsConfig::default());
//! for client in [&alice, &bob] {
//!     client.on_channel_state(ChannelState::Attached { has_objects: false });
//! }
//!
//! // Alice creates a counter and links it from the root map
//! let counter = alice.create_counter(0.0).await.unwrap();
//! alice.root().set("visits", &counter).await.unwrap();
//! counter.increment(5.0).await.unwrap();
//!
//! // Both clients receive the same channel traffic
//! alice.handle_object_messages(alice.channel().drain()).unwrap();
//! bob.handle_object_messages(bob.channel().drain()).unwrap();
//!
//! let visits = bob.root().get("visits").unwrap();
//! assert_eq!(visits.as_counter().unwrap().value(), 5.0);
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`objects`] - The `LiveObjects` facade: inbound entry points and object creation
//! - [`handles`] - `LiveMap` / `LiveCounter` handles for reads, writes and subscriptions
//! - [`pipeline`] - Routes inbound messages, buffers during sync, emits change events
//! - [`pool`] - The object graph store
//! - [`sync`] - Sync sequences and snapshot reconciliation
//! - [`subscription`] - Per-object listener registries
//! - [`gc`] - Tombstone garbage collection
//! - [`channel`] - The channel contract and an in-memory channel for tests
//! - [`config`] - Engine configuration
//! - [`error`] - Error types

pub mod channel;
pub mod config;
pub mod error;
pub mod gc;
pub mod handles;
pub mod objects;
pub mod pipeline;
pub mod pool;
pub mod subscription;
pub mod sync;

// Re-exports for convenience
pub use channel::{ChannelError, ChannelState, MemoryChannel, MemoryHub, ObjectsChannel};
pub use config::{ObjectsConfig, ObjectsConfigBuilder};
pub use error::{ObjectsError, Result};
pub use gc::GcReport;
pub use handles::{LiveCounter, LiveMap, MapValue};
pub use objects::LiveObjects;
pub use pipeline::{ObjectsEvent, SyncState};
pub use pool::ObjectsPool;
pub use subscription::{Listeners, Subscription};

// Re-export commonly used types from liveobjects-core
pub use liveobjects_core::{
    MapChange, ObjectData, ObjectId, ObjectKind, ObjectMessage, ObjectState, ObjectUpdate,
    UpdateKind,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{ChannelState, ObjectsChannel};
    pub use crate::config::ObjectsConfig;
    pub use crate::error::ObjectsError;
    pub use crate::handles::{LiveCounter, LiveMap, MapValue};
    pub use crate::objects::LiveObjects;
    pub use crate::pipeline::ObjectsEvent;
    pub use liveobjects_core::{MapChange, ObjectData, ObjectUpdate};
}
