use std::collections::HashSet;

use tracing::debug;

use objstate_core::{LifecycleState, ObjectId};

use crate::error::EngineError;

/// What a walk needs from the unit of work holding the objects.
pub trait ReachabilityScope {
    /// `None` when the id has no bound state manager here.
    fn state_of(&self, id: ObjectId) -> Option<LifecycleState>;

    fn is_enlisted(&self, id: ObjectId) -> bool;

    fn load_unloaded_relation_fields(&mut self, id: ObjectId) -> Result<(), EngineError>;

    /// References held by loaded relation fields marked for cascade persist.
    fn cascade_targets(&self, id: ObjectId) -> Vec<ObjectId>;
}

/// Walks the cascade-persist relations of one owner.
pub struct ReachabilityWalker {
    owner: ObjectId,
}

impl ReachabilityWalker {
    pub fn new(owner: ObjectId) -> Self {
        Self { owner }
    }

    /// Everything reachable from `root`, including the root itself.
    pub fn reach(
        root: ObjectId,
        scope: &mut dyn ReachabilityScope,
        reachable: &mut HashSet<ObjectId>,
    ) -> Result<(), EngineError> {
        Self::process(root, scope, reachable)
    }

    pub fn walk(
        &self,
        scope: &mut dyn ReachabilityScope,
        reachable: &mut HashSet<ObjectId>,
    ) -> Result<(), EngineError> {
        for target in scope.cascade_targets(self.owner) {
            Self::process(target, scope, reachable)?;
        }
        Ok(())
    }

    fn process(
        id: ObjectId,
        scope: &mut dyn ReachabilityScope,
        reachable: &mut HashSet<ObjectId>,
    ) -> Result<(), EngineError> {
        let Some(state) = scope.state_of(id) else {
            debug!(object = %id, "reachability skipped unbound object");
            return Ok(());
        };
        if state.is_deleted() || reachable.contains(&id) {
            return Ok(());
        }
        if scope.is_enlisted(id) {
            scope.load_unloaded_relation_fields(id)?;
        }
        reachable.insert(id);
        debug!(object = %id, state = state.as_str(), "reachability visit");
        ReachabilityWalker::new(id).walk(scope, reachable)
    }
}
