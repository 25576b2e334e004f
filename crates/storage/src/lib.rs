pub mod error;
pub mod generation;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use generation::{SequenceSource, ValueGenerationManager, ValueGenerator};
pub use sqlite::SqliteStorage;
pub use traits::*;
