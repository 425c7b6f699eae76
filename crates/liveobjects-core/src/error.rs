//! Errors raised while decoding or merging object operations.

use crate::object_id::{ObjectId, ObjectKind};
use crate::message::ObjectOperationAction;
use thiserror::Error;

/// Protocol-level failures. None of these corrupt existing state: the
/// offending operation or snapshot is rejected as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("Missing field `{field}` in {context}")]
    MissingField {
        field: &'static str,
        context: String,
    },

    #[error("Operation {action:?} cannot target {found} object {object_id}")]
    VariantMismatch {
        action: ObjectOperationAction,
        object_id: ObjectId,
        found: ObjectKind,
    },

    #[error("Operation for {operation} routed to object {object_id}")]
    WrongObject {
        operation: ObjectId,
        object_id: ObjectId,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Malformed state for {object_id}: {reason}")]
    MalformedState { object_id: ObjectId, reason: String },

    #[error("The root object cannot be {0}")]
    RootImmutable(&'static str),
}

impl MergeError {
    pub(crate) fn missing(field: &'static str, context: impl Into<String>) -> Self {
        MergeError::MissingField {
            field,
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
