//! Error types for the Live Objects SDK.

use crate::channel::ChannelState;
use liveobjects_core::{MergeError, ObjectId, ObjectKind};
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum ObjectsError {
    /// Malformed operation or variant mismatch.
    #[error("Protocol error: {0}")]
    Protocol(#[from] MergeError),

    /// A sync snapshot could not be applied; the previous graph was kept.
    #[error("Malformed sync: {0}")]
    MalformedSync(String),

    /// A write was attempted while the channel cannot publish.
    #[error("Channel is {state:?}; object writes are not allowed")]
    ChannelState { state: ChannelState },

    /// The channel refused the outbound message.
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("Object {object_id} is a {found}, expected a {expected}")]
    WrongType {
        object_id: ObjectId,
        expected: ObjectKind,
        found: ObjectKind,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine was dropped while a caller was waiting on it.
    #[error("Live objects engine closed")]
    Closed,
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, ObjectsError>;
