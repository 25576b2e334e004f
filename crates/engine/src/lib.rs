pub mod config;
pub mod context;
pub mod detached;
pub mod error;
pub mod queue;
pub mod reachability;
pub mod relations;
pub mod runtime;
pub mod sco;
pub mod state;

pub use config::ContextConfig;
pub use context::ExecutionContext;
pub use detached::{DetachedGraph, DetachedObject};
pub use error::EngineError;
pub use queue::OperationQueue;
pub use reachability::{ReachabilityScope, ReachabilityWalker};
pub use relations::{RelationChange, RelationChangeKind, RelationshipManager};
pub use runtime::{OwnershipRegistry, PersistenceRuntime};
pub use sco::{Sco, ScoHost, WrapperFactory, WrapperRegistry};
pub use state::{FieldSlot, StateManager, StateManagerPool};
