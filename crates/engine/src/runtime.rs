use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use objstate_core::{ClassMeta, ContextId, MetadataProvider, ObjectId};
use objstate_storage::{PersistenceHandler, ValueGenerationManager};

use crate::config::ContextConfig;
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::sco::WrapperRegistry;

/// Which execution context currently manages each object id.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    owners: Mutex<HashMap<ObjectId, ContextId>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `context`. Claiming an id already held by the same
    /// context succeeds.
    pub fn claim(&self, id: ObjectId, context: ContextId) -> Result<(), EngineError> {
        let mut owners = self.owners.lock();
        match owners.get(&id) {
            Some(owner) if *owner != context => Err(EngineError::CrossContext(id)),
            _ => {
                owners.insert(id, context);
                Ok(())
            }
        }
    }

    pub fn owner_of(&self, id: ObjectId) -> Option<ContextId> {
        self.owners.lock().get(&id).copied()
    }

    /// Fails when another context holds `id`.
    pub fn check(&self, id: ObjectId, context: ContextId) -> Result<(), EngineError> {
        match self.owner_of(id) {
            Some(owner) if owner != context => Err(EngineError::CrossContext(id)),
            _ => Ok(()),
        }
    }

    pub fn release(&self, id: ObjectId, context: ContextId) {
        let mut owners = self.owners.lock();
        if owners.get(&id) == Some(&context) {
            owners.remove(&id);
        }
    }

    pub fn release_all(&self, context: ContextId) {
        self.owners.lock().retain(|_, owner| *owner != context);
    }

    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }
}

/// Process-wide state shared by every execution context.
pub struct PersistenceRuntime {
    metadata: Box<dyn MetadataProvider>,
    generators: ValueGenerationManager,
    ownership: OwnershipRegistry,
    wrappers: WrapperRegistry,
    config: ContextConfig,
}

impl PersistenceRuntime {
    pub fn new(metadata: impl MetadataProvider + 'static) -> Self {
        Self {
            metadata: Box::new(metadata),
            generators: ValueGenerationManager::default(),
            ownership: OwnershipRegistry::new(),
            wrappers: WrapperRegistry::default(),
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_generators(mut self, generators: ValueGenerationManager) -> Self {
        self.generators = generators;
        self
    }

    pub fn with_wrappers(mut self, wrappers: WrapperRegistry) -> Self {
        self.wrappers = wrappers;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn class(&self, name: &str) -> Result<Arc<ClassMeta>, EngineError> {
        self.metadata
            .class(name)
            .ok_or_else(|| EngineError::UnknownClass(name.to_string()))
    }

    pub fn generators(&self) -> &ValueGenerationManager {
        &self.generators
    }

    pub fn ownership(&self) -> &OwnershipRegistry {
        &self.ownership
    }

    pub fn wrappers(&self) -> &WrapperRegistry {
        &self.wrappers
    }

    pub fn default_config(&self) -> &ContextConfig {
        &self.config
    }

    /// Open a unit of work over `backend`, starting from the default config.
    pub fn open_context(
        self: &Arc<Self>,
        backend: Box<dyn PersistenceHandler>,
    ) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(self), backend)
    }
}
