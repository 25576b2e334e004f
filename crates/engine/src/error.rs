use objstate_core::{CoreError, ObjectId};
use objstate_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid element: {0}")]
    InvalidElement(String),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("object {0} is managed by another execution context")]
    CrossContext(ObjectId),

    #[error("wrapper is not bound to an owning object")]
    Unbound,

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("object not managed by this context: {0}")]
    NotManaged(ObjectId),

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("generated value {value} for {member} cannot be converted to the field type")]
    ValueConversion { member: String, value: String },

    #[error("invalid property: {0}")]
    InvalidProperty(String),

    #[error("no active transaction")]
    NoActiveTransaction,
}
