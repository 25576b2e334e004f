use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("optimistic conflict on {object_id}: expected version {expected:?}, found {found:?}")]
    OptimisticConflict {
        object_id: String,
        expected: Option<i64>,
        found: Option<i64>,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("core error: {0}")]
    Core(#[from] objstate_core::CoreError),
}
