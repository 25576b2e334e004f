use thiserror::Error;

use crate::lifecycle::{LifecycleEvent, LifecycleState};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("illegal lifecycle transition: {event:?} from {from:?}")]
    IllegalTransition {
        from: LifecycleState,
        event: LifecycleEvent,
    },

    #[error("unknown field {field} on class {class}")]
    UnknownField { class: String, field: usize },

    #[error("invalid data: {0}")]
    InvalidData(String),
}
