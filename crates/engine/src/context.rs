use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use objstate_core::{
    ClassMeta, ContextId, CoreError, FieldData, FieldMeta, FieldOwner, LifecycleEvent,
    LifecycleState, ObjectId, Value,
    operations::{Operation, OperationKind, OperationPayload},
};
use objstate_storage::{ObjectRecord, PersistenceHandler};

use crate::config::ContextConfig;
use crate::detached::{DetachedGraph, DetachedObject};
use crate::error::EngineError;
use crate::queue::OperationQueue;
use crate::reachability::{ReachabilityScope, ReachabilityWalker};
use crate::relations::{RelationChange, RelationChangeKind, RelationshipManager};
use crate::runtime::PersistenceRuntime;
use crate::sco::{Sco, ScoHost};
use crate::state::{FieldSlot, StateManager, StateManagerPool};

/// Work a wrapper call asked for that has to wait until the wrapper is
/// back in its slot.
#[derive(Debug, Default)]
struct HostEffects {
    deletes: Vec<ObjectId>,
    flush: bool,
}

/// The context, split so a wrapper taken out of one object can mark
/// objects dirty and queue operations while it runs.
struct ContextHost<'a> {
    objects: &'a mut IndexMap<ObjectId, StateManager>,
    queue: &'a mut OperationQueue,
    relations: &'a mut RelationshipManager,
    effects: &'a mut HostEffects,
    manage_relations: bool,
    queued_updates: bool,
    tx_active: bool,
}

impl ScoHost for ContextHost<'_> {
    fn make_dirty(&mut self, owner: FieldOwner) {
        if let Some(sm) = self.objects.get_mut(&owner.object) {
            sm.make_dirty(owner.field);
        }
    }

    fn queue_active(&self, owner: FieldOwner) -> bool {
        self.queued_updates
            && self.tx_active
            && self.objects.get(&owner.object).is_some_and(|sm| {
                let state = sm.lifecycle();
                state.is_persistent() && !state.is_new() && !state.is_deleted()
            })
    }

    fn enqueue(&mut self, op: Operation) {
        self.queue.push(op);
    }

    fn manage_relations(&self) -> bool {
        self.manage_relations
    }

    fn relation_add(&mut self, owner: FieldOwner, element: &Value) {
        self.relations.relation_add(owner, element);
    }

    fn relation_remove(&mut self, owner: FieldOwner, element: &Value) {
        self.relations.relation_remove(owner, element);
    }

    fn delete_dependent(&mut self, element: &Value) {
        if let Some(id) = element.as_ref_id() {
            self.effects.deletes.push(id);
        }
    }

    fn transaction_active(&self) -> bool {
        self.tx_active
    }

    fn nontransactional_update(&mut self, owner: FieldOwner) {
        if self
            .objects
            .get(&owner.object)
            .is_some_and(|sm| sm.lifecycle().is_persistent())
        {
            self.effects.flush = true;
        }
    }
}

/// A unit of work: the managed objects of one session, their pending
/// changes, and the backend they are flushed to.
pub struct ExecutionContext {
    id: ContextId,
    runtime: Arc<PersistenceRuntime>,
    backend: Box<dyn PersistenceHandler>,
    config: ContextConfig,
    objects: IndexMap<ObjectId, StateManager>,
    pool: StateManagerPool,
    queue: OperationQueue,
    relations: RelationshipManager,
    tx_active: bool,
}

impl ExecutionContext {
    pub(crate) fn new(
        runtime: Arc<PersistenceRuntime>,
        backend: Box<dyn PersistenceHandler>,
    ) -> Self {
        let config = runtime.default_config().clone();
        Self {
            id: ContextId::new(),
            pool: StateManagerPool::new(config.pool_capacity),
            runtime,
            backend,
            config,
            objects: IndexMap::new(),
            queue: OperationQueue::new(),
            relations: RelationshipManager::new(),
            tx_active: false,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Override a setting for this context only.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.config.set_property(name, value)
    }

    pub fn is_transaction_active(&self) -> bool {
        self.tx_active
    }

    pub fn is_managed(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn lifecycle(&self, id: ObjectId) -> Option<LifecycleState> {
        self.objects.get(&id).map(|sm| sm.lifecycle())
    }

    pub fn state(&self, id: ObjectId) -> Option<&StateManager> {
        self.objects.get(&id)
    }

    pub fn managed_count(&self) -> usize {
        self.objects.len()
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn pool(&self) -> &StateManagerPool {
        &self.pool
    }

    fn sm(&self, id: ObjectId) -> Result<&StateManager, EngineError> {
        self.objects.get(&id).ok_or(EngineError::NotManaged(id))
    }

    fn sm_mut(&mut self, id: ObjectId) -> Result<&mut StateManager, EngineError> {
        self.objects.get_mut(&id).ok_or(EngineError::NotManaged(id))
    }

    fn class_of(&self, id: ObjectId) -> Result<Arc<ClassMeta>, EngineError> {
        Ok(Arc::clone(self.sm(id)?.class()))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&mut self) -> Result<(), EngineError> {
        if self.tx_active {
            return Ok(());
        }
        self.backend.begin()?;
        self.tx_active = true;
        debug!(context = %self.id, "transaction started");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), EngineError> {
        if !self.tx_active {
            return Err(EngineError::NoActiveTransaction);
        }
        if self.config.reachability_at_commit {
            self.release_unreachable()?;
        }
        self.flush()?;
        self.backend.commit()?;
        self.tx_active = false;

        let retain_values = self.config.retain_values;
        for sm in self.objects.values_mut() {
            sm.explicitly_persisted = false;
            sm.created_in_tx = false;
            if !sm.lifecycle().is_persistent() {
                continue;
            }
            if sm.transition(LifecycleEvent::Commit { retain_values })? == LifecycleState::Hollow {
                sm.unload_all();
            }
        }
        debug!(context = %self.id, "transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), EngineError> {
        if !self.tx_active {
            return Err(EngineError::NoActiveTransaction);
        }
        self.queue.clear();
        self.relations.clear();
        self.tx_active = false;

        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in ids {
            let Some(sm) = self.objects.get_mut(&id) else {
                continue;
            };
            let state = sm.lifecycle();
            if state == LifecycleState::Transient {
                continue;
            }
            if state.is_new() || sm.created_in_tx {
                self.disconnect(id);
            } else {
                sm.transition(LifecycleEvent::Rollback)?;
                sm.unload_all();
            }
        }
        self.backend.rollback()?;
        debug!(context = %self.id, "transaction rolled back");
        Ok(())
    }

    /// Cascade-persisted new objects that nothing reaches any more go back
    /// to transient.
    fn release_unreachable(&mut self) -> Result<(), EngineError> {
        let roots: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|sm| {
                sm.explicitly_persisted
                    || matches!(
                        sm.lifecycle(),
                        LifecycleState::PersistentClean | LifecycleState::PersistentDirty
                    )
            })
            .map(|sm| sm.id())
            .collect();

        let mut reachable = HashSet::new();
        for root in roots {
            ReachabilityWalker::reach(root, self, &mut reachable)?;
        }

        let orphans: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|sm| {
                sm.lifecycle() == LifecycleState::PersistentNew
                    && !sm.explicitly_persisted
                    && !reachable.contains(&sm.id())
            })
            .map(|sm| sm.id())
            .collect();
        for id in orphans {
            debug!(object = %id, "unreachable at commit, reverting to transient");
            let sm = self.sm_mut(id)?;
            sm.transition(LifecycleEvent::Rollback)?;
            sm.clear_dirty();
            sm.created_in_tx = false;
            self.runtime.ownership().release(id, self.id);
        }
        Ok(())
    }

    // ========================================================================
    // Binding objects
    // ========================================================================

    fn make_slot(
        &self,
        id: ObjectId,
        meta: &FieldMeta,
        data: Option<FieldData>,
    ) -> Result<FieldSlot, EngineError> {
        match meta.container {
            Some(shape) => Ok(FieldSlot::Sco(self.runtime.wrappers().wrap(
                shape,
                FieldOwner::new(id, meta.number),
                meta.container_policy(),
                data,
            )?)),
            None => match data {
                None => Ok(FieldSlot::Value(Value::Null)),
                Some(FieldData::Scalar(value)) => Ok(FieldSlot::Value(value)),
                Some(_) => Err(EngineError::ShapeMismatch {
                    expected: "scalar",
                    found: "container data",
                }),
            },
        }
    }

    /// A transient instance of `class_name` with every field empty.
    pub fn new_object(&mut self, class_name: &str) -> Result<ObjectId, EngineError> {
        let class = self.runtime.class(class_name)?;
        let id = ObjectId::new();
        let mut sm = self.pool.acquire(id, Arc::clone(&class), LifecycleState::Transient);
        for meta in class.fields() {
            sm.install(meta.number, self.make_slot(id, meta, None)?);
        }
        self.objects.insert(id, sm);
        Ok(id)
    }

    fn bind_hollow(
        &mut self,
        id: ObjectId,
        class: Arc<ClassMeta>,
        version: Option<i64>,
    ) -> Result<(), EngineError> {
        self.runtime.ownership().claim(id, self.id)?;
        let mut sm = self.pool.acquire(id, class, LifecycleState::Hollow);
        sm.set_version(version);
        self.objects.insert(id, sm);
        debug!(object = %id, context = %self.id, "bound hollow object");
        Ok(())
    }

    /// Bind an id known only to the backend.
    fn ensure_managed(&mut self, id: ObjectId) -> Result<(), EngineError> {
        if self.objects.contains_key(&id) {
            return Ok(());
        }
        self.runtime.ownership().check(id, self.id)?;
        let header = self
            .backend
            .exists(id)?
            .ok_or(EngineError::ObjectNotFound(id))?;
        let class = self.runtime.class(&header.class_name)?;
        self.bind_hollow(id, class, header.version)
    }

    /// Look up an object by id. The object is bound hollow; with `validate`
    /// its existence is checked against the backend first.
    pub fn find(
        &mut self,
        class_name: &str,
        id: ObjectId,
        validate: bool,
    ) -> Result<ObjectId, EngineError> {
        if self.objects.contains_key(&id) {
            return Ok(id);
        }
        let class = self.runtime.class(class_name)?;
        let version = if validate {
            let header = self
                .backend
                .exists(id)?
                .ok_or(EngineError::ObjectNotFound(id))?;
            if header.class_name != class.name {
                return Err(EngineError::ObjectNotFound(id));
            }
            header.version
        } else {
            None
        };
        self.bind_hollow(id, class, version)?;
        Ok(id)
    }

    fn make_persistent(&mut self, id: ObjectId, explicit: bool) -> Result<(), EngineError> {
        self.runtime.ownership().claim(id, self.id)?;
        let tx_active = self.tx_active;
        let sm = self.sm_mut(id)?;
        sm.transition(LifecycleEvent::MakePersistent)?;
        sm.explicitly_persisted |= explicit;
        sm.created_in_tx = tx_active;
        debug!(object = %id, explicit, "object made persistent");
        Ok(())
    }

    fn cascade_persist(
        &mut self,
        id: ObjectId,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<(), EngineError> {
        if !visited.insert(id) {
            return Ok(());
        }
        for target in self.cascade_targets(id) {
            match self.lifecycle(target) {
                Some(LifecycleState::Transient) => {
                    self.make_persistent(target, false)?;
                    self.cascade_persist(target, visited)?;
                }
                Some(state) if !state.is_deleted() => self.cascade_persist(target, visited)?,
                Some(_) => {}
                None => self.runtime.ownership().check(target, self.id)?,
            }
        }
        Ok(())
    }

    /// Make a transient object persistent, cascading through cascade-persist
    /// relations. Persisting an object that is still new flushes it.
    pub fn persist(&mut self, id: ObjectId) -> Result<(), EngineError> {
        let state = self.sm(id)?.lifecycle();
        match state {
            LifecycleState::PersistentNew => {
                self.flush_new(Some(id))?;
                Ok(())
            }
            LifecycleState::Transient => {
                self.make_persistent(id, true)?;
                self.cascade_persist(id, &mut HashSet::new())
            }
            state if state.is_deleted() => Err(CoreError::IllegalTransition {
                from: state,
                event: LifecycleEvent::MakePersistent,
            }
            .into()),
            _ => self.cascade_persist(id, &mut HashSet::new()),
        }
    }

    /// Return a state manager to the pool and give up its id.
    fn disconnect(&mut self, id: ObjectId) {
        if let Some(sm) = self.objects.shift_remove(&id) {
            self.runtime.ownership().release(id, self.id);
            self.queue.discard_object(id);
            self.pool.release(sm);
        }
    }

    // ========================================================================
    // Field access
    // ========================================================================

    fn load_map_field(
        &mut self,
        id: ObjectId,
        class: &ClassMeta,
        field: usize,
    ) -> Result<FieldData, EngineError> {
        let fetch = self.backend.load_map(id, class, field)?;
        if let Some(keys) = &fetch.keys {
            if keys.len() != fetch.entries.len() {
                warn!(
                    object = %id,
                    field,
                    keys = keys.len(),
                    entries = fetch.entries.len(),
                    "map key count does not match its entries"
                );
            }
        }
        if let Some(values) = &fetch.values {
            if values.len() != fetch.entries.len() {
                warn!(
                    object = %id,
                    field,
                    values = values.len(),
                    entries = fetch.entries.len(),
                    "map value count does not match its entries"
                );
            }
        }
        Ok(FieldData::Map(fetch.entries))
    }

    /// Materialize `fields` that are not yet loaded, in one backend load
    /// plus one map fetch per map field.
    fn ensure_loaded(&mut self, id: ObjectId, fields: &[usize]) -> Result<(), EngineError> {
        let sm = self.sm(id)?;
        let class = Arc::clone(sm.class());
        let missing = sm.loaded_fields().select(fields, false);
        if missing.is_empty() {
            return Ok(());
        }
        for field in &missing {
            class.member(*field)?;
        }

        let state = sm.lifecycle();
        if state == LifecycleState::Transient || state.is_new() {
            // Nothing to read yet; unset fields start empty.
            for field in missing {
                let slot = self.make_slot(id, class.member(field)?, None)?;
                self.sm_mut(id)?.install(field, slot);
            }
            return Ok(());
        }

        let count = missing.len();
        let (maps, others): (Vec<usize>, Vec<usize>) = missing
            .into_iter()
            .partition(|field| class.member(*field).is_ok_and(|m| m.is_map()));
        let mut loaded = Vec::with_capacity(count);
        if !others.is_empty() {
            loaded.extend(self.backend.load(id, &class, &others)?);
        }
        for field in maps {
            loaded.push((field, self.load_map_field(id, &class, field)?));
        }
        debug!(object = %id, fields = count, "loaded fields");

        for (field, data) in loaded {
            let slot = self.make_slot(id, class.member(field)?, Some(data))?;
            self.sm_mut(id)?.install(field, slot);
        }
        let sm = self.sm_mut(id)?;
        if sm.lifecycle() == LifecycleState::Hollow {
            sm.transition(LifecycleEvent::ReadField)?;
        }
        Ok(())
    }

    pub fn read_field(&mut self, id: ObjectId, field: usize) -> Result<FieldData, EngineError> {
        self.ensure_loaded(id, &[field])?;
        let sm = self.sm(id)?;
        sm.field_data(field).ok_or_else(|| {
            EngineError::Core(CoreError::UnknownField {
                class: sm.class().name.clone(),
                field,
            })
        })
    }

    /// Load every relation field that is not loaded yet.
    pub fn load_unloaded_relation_fields(&mut self, id: ObjectId) -> Result<(), EngineError> {
        let class = self.class_of(id)?;
        self.ensure_loaded(id, &class.relation_field_numbers())
    }

    /// Replace a field wholesale. Second-class fields get a fresh wrapper and
    /// any queued changes to them are dropped.
    pub fn set_field(
        &mut self,
        id: ObjectId,
        field: usize,
        data: FieldData,
    ) -> Result<(), EngineError> {
        self.check_writable(id)?;
        let class = self.class_of(id)?;
        let meta = class.member(field)?;
        if let FieldData::Scalar(value) = &data {
            if value.is_null() && !meta.allow_nulls {
                return Err(EngineError::InvalidElement(format!(
                    "{}.{} cannot be null",
                    class.name, meta.name
                )));
            }
        }

        let track_relations = self.config.manage_relations && meta.mapped_by.is_some();
        let previous = if track_relations {
            self.ensure_loaded(id, &[field])?;
            self.sm(id)?.field_data(field)
        } else {
            None
        };

        let slot = self.make_slot(id, meta, Some(data.clone()))?;
        let owner = FieldOwner::new(id, field);
        self.queue.discard_field(owner);
        let sm = self.sm_mut(id)?;
        sm.install(field, slot);
        sm.make_dirty(field);
        let persistent = sm.lifecycle().is_persistent();

        if let Some(previous) = previous {
            let old = previous.references();
            let new = data.references();
            for target in old.iter().filter(|t| !new.contains(t)) {
                self.relations.relation_remove(owner, &Value::Ref(*target));
            }
            for target in new.iter().filter(|t| !old.contains(t)) {
                self.relations.relation_add(owner, &Value::Ref(*target));
            }
        }
        let flush = !self.tx_active && persistent;
        self.process_effects(HostEffects {
            deletes: Vec::new(),
            flush,
        })
    }

    /// Deleted objects reject field writes.
    fn check_writable(&self, id: ObjectId) -> Result<(), EngineError> {
        if let Some(state) = self.lifecycle(id) {
            if state.is_deleted() {
                state.transition(LifecycleEvent::WriteField)?;
            }
        }
        Ok(())
    }

    fn run_sco<R>(
        &mut self,
        id: ObjectId,
        field: usize,
        manage_relations: bool,
        f: impl FnOnce(&mut Sco, &mut dyn ScoHost) -> Result<R, EngineError>,
    ) -> Result<(R, HostEffects), EngineError> {
        self.check_writable(id)?;
        self.ensure_loaded(id, &[field])?;
        let mut sco = self
            .sm_mut(id)?
            .take_sco(field)
            .ok_or(EngineError::ShapeMismatch {
                expected: "second-class field",
                found: "plain value",
            })?;

        let mut effects = HostEffects::default();
        let result = {
            let mut host = ContextHost {
                objects: &mut self.objects,
                queue: &mut self.queue,
                relations: &mut self.relations,
                effects: &mut effects,
                manage_relations,
                queued_updates: self.config.queued_updates,
                tx_active: self.tx_active,
            };
            f(&mut sco, &mut host)
        };
        if let Some(sm) = self.objects.get_mut(&id) {
            sm.restore_sco(field, sco);
        }
        result.map(|value| (value, effects))
    }

    /// Run a mutation against the wrapper of a second-class field, then
    /// reconcile inverse relations, delete orphaned dependents, and flush
    /// when outside a transaction.
    pub fn with_sco_mut<R>(
        &mut self,
        id: ObjectId,
        field: usize,
        f: impl FnOnce(&mut Sco, &mut dyn ScoHost) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let manage_relations = self.config.manage_relations;
        let (value, effects) = self.run_sco(id, field, manage_relations, f)?;
        self.process_effects(effects)?;
        Ok(value)
    }

    fn process_effects(&mut self, effects: HostEffects) -> Result<(), EngineError> {
        let changes = self.relations.take();
        if self.config.manage_relations {
            for change in changes {
                self.apply_inverse(change)?;
            }
        }
        for id in effects.deletes {
            self.delete_dependent(id)?;
        }
        if effects.flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Mirror one relation change onto the inverse field of the target.
    fn apply_inverse(&mut self, change: RelationChange) -> Result<(), EngineError> {
        let Some(owner_sm) = self.objects.get(&change.owner.object) else {
            return Ok(());
        };
        let owner_class = Arc::clone(owner_sm.class());
        let Some(inverse) = owner_class.member(change.owner.field)?.mapped_by else {
            return Ok(());
        };
        let target_class = match self.objects.get(&change.target) {
            Some(target) if !target.lifecycle().is_deleted() => Arc::clone(target.class()),
            _ => return Ok(()),
        };
        let inverse_meta = target_class.member(inverse)?;
        self.ensure_loaded(change.target, &[inverse])?;

        let back = Value::Ref(change.owner.object);
        if inverse_meta.is_collection() {
            self.run_sco(change.target, inverse, false, |sco, host| match change.kind {
                RelationChangeKind::Added if !sco.contains(&back) => sco.add(host, back.clone()),
                RelationChangeKind::Added => Ok(false),
                RelationChangeKind::Removed => sco.remove(host, &back, false),
            })?;
        } else if !inverse_meta.is_sco() {
            let current = self
                .sm(change.target)?
                .field_data(inverse)
                .and_then(|data| data.as_scalar().cloned())
                .unwrap_or(Value::Null);
            let next = match change.kind {
                RelationChangeKind::Added => back,
                RelationChangeKind::Removed if current == back => Value::Null,
                RelationChangeKind::Removed => current.clone(),
            };
            if next != current {
                let sm = self.sm_mut(change.target)?;
                sm.install(inverse, FieldSlot::Value(next));
                sm.make_dirty(inverse);
            }
        }
        Ok(())
    }

    pub fn collection_add(
        &mut self,
        id: ObjectId,
        field: usize,
        element: impl Into<Value>,
    ) -> Result<bool, EngineError> {
        let element = element.into();
        self.with_sco_mut(id, field, |sco, host| sco.add(host, element))
    }

    pub fn collection_add_all(
        &mut self,
        id: ObjectId,
        field: usize,
        elements: Vec<Value>,
    ) -> Result<bool, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.add_all(host, elements))
    }

    pub fn collection_remove(
        &mut self,
        id: ObjectId,
        field: usize,
        element: &Value,
    ) -> Result<bool, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.remove(host, element, true))
    }

    pub fn collection_remove_all(
        &mut self,
        id: ObjectId,
        field: usize,
        elements: &[Value],
    ) -> Result<bool, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.remove_all(host, elements))
    }

    pub fn collection_retain_all(
        &mut self,
        id: ObjectId,
        field: usize,
        keep: &[Value],
    ) -> Result<bool, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.retain_all(host, keep))
    }

    pub fn collection_clear(&mut self, id: ObjectId, field: usize) -> Result<(), EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.clear(host))
    }

    pub fn list_insert(
        &mut self,
        id: ObjectId,
        field: usize,
        index: usize,
        element: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let element = element.into();
        self.with_sco_mut(id, field, |sco, host| {
            sco.as_list_mut()?.insert(host, index, element)
        })
    }

    pub fn list_set(
        &mut self,
        id: ObjectId,
        field: usize,
        index: usize,
        element: impl Into<Value>,
    ) -> Result<Value, EngineError> {
        let element = element.into();
        self.with_sco_mut(id, field, |sco, host| {
            sco.as_list_mut()?.set(host, index, element, true)
        })
    }

    pub fn list_remove_at(
        &mut self,
        id: ObjectId,
        field: usize,
        index: usize,
    ) -> Result<Value, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.as_list_mut()?.remove_at(host, index))
    }

    pub fn map_put(
        &mut self,
        id: ObjectId,
        field: usize,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, EngineError> {
        let (key, value) = (key.into(), value.into());
        self.with_sco_mut(id, field, |sco, host| sco.put(host, key, value))
    }

    pub fn map_remove(
        &mut self,
        id: ObjectId,
        field: usize,
        key: &Value,
    ) -> Result<Option<Value>, EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.remove_key(host, key))
    }

    pub fn map_clear(&mut self, id: ObjectId, field: usize) -> Result<(), EngineError> {
        self.with_sco_mut(id, field, |sco, host| sco.clear(host))
    }

    pub fn scalar_set(
        &mut self,
        id: ObjectId,
        field: usize,
        value: impl Into<Value>,
    ) -> Result<Value, EngineError> {
        let value = value.into();
        self.with_sco_mut(id, field, |sco, host| sco.set_scalar(host, value))
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Delete an object and, recursively, everything its dependent fields own.
    pub fn delete(&mut self, id: ObjectId) -> Result<(), EngineError> {
        self.delete_cascade(id, &mut HashSet::new())
    }

    /// Dependent deletes tolerate objects that are already gone or were never stored.
    fn delete_dependent(&mut self, id: ObjectId) -> Result<(), EngineError> {
        match self.lifecycle(id) {
            Some(LifecycleState::Transient) => Ok(()),
            Some(state) if state.is_deleted() => Ok(()),
            Some(_) => self.delete(id),
            None => match self.ensure_managed(id) {
                Ok(()) => self.delete(id),
                Err(EngineError::ObjectNotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    fn delete_cascade(
        &mut self,
        id: ObjectId,
        visited: &mut HashSet<ObjectId>,
    ) -> Result<(), EngineError> {
        if !visited.insert(id) {
            return Ok(());
        }
        self.ensure_managed(id)?;
        let sm = self.sm(id)?;
        let state = sm.lifecycle();
        if state.is_deleted() {
            return Ok(());
        }
        state.transition(LifecycleEvent::Delete)?;

        let class = Arc::clone(sm.class());
        let dependent_fields: Vec<usize> = class
            .fields()
            .iter()
            .filter(|meta| {
                let policy = meta.container_policy();
                (meta.dependent && meta.is_relation())
                    || policy.dependent_elements
                    || policy.dependent_keys
                    || policy.dependent_values
            })
            .map(|meta| meta.number)
            .collect();
        self.ensure_loaded(id, &dependent_fields)?;

        let sm = self.sm(id)?;
        let mut targets = Vec::new();
        for &field in &dependent_fields {
            let policy = class.member(field)?.container_policy();
            match sm.field_data(field) {
                Some(FieldData::Scalar(value)) => targets.extend(value.as_ref_id()),
                Some(FieldData::Collection(items)) => {
                    targets.extend(items.iter().filter_map(Value::as_ref_id))
                }
                Some(FieldData::Map(entries)) => {
                    for (key, value) in entries {
                        if policy.dependent_keys {
                            targets.extend(key.as_ref_id());
                        }
                        if policy.dependent_values {
                            targets.extend(value.as_ref_id());
                        }
                    }
                }
                None => {}
            }
        }

        let sm = self.sm_mut(id)?;
        sm.transition(LifecycleEvent::Delete)?;
        sm.unset_wrapper_owners();
        self.queue.discard_object(id);
        debug!(object = %id, dependents = targets.len(), "object deleted");

        for target in targets {
            match self.lifecycle(target) {
                Some(LifecycleState::Transient) => {}
                Some(_) => self.delete_cascade(target, visited)?,
                None => match self.ensure_managed(target) {
                    Ok(()) => self.delete_cascade(target, visited)?,
                    Err(EngineError::ObjectNotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change to the backend: inserts, queued container
    /// operations, updates, then deletes. On failure the remaining work stays
    /// pending and a later flush resumes it.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        let inserted = self.flush_new(None)?;
        let queued_fields: HashSet<FieldOwner> =
            self.queue.iter().map(Operation::field_owner).collect();
        let applied = self.apply_queue()?;
        let updated = self.flush_updates(&queued_fields)?;
        let deleted = self.flush_deletes()?;
        debug!(
            context = %self.id,
            inserted,
            applied,
            updated,
            deleted,
            "flush complete"
        );
        Ok(())
    }

    fn insert_order(
        &self,
        id: ObjectId,
        pending: &HashSet<ObjectId>,
        visited: &mut HashSet<ObjectId>,
        order: &mut Vec<ObjectId>,
    ) {
        if !pending.contains(&id) || !visited.insert(id) {
            return;
        }
        if let Some(sm) = self.objects.get(&id) {
            for target in sm.references_in(&sm.class().relation_field_numbers()) {
                self.insert_order(target, pending, visited, order);
            }
        }
        order.push(id);
    }

    /// Insert new objects, referenced objects first. `only` limits the
    /// pass to one object and the new objects it depends on.
    fn flush_new(&mut self, only: Option<ObjectId>) -> Result<usize, EngineError> {
        let pending: HashSet<ObjectId> = self
            .objects
            .values()
            .filter(|sm| sm.lifecycle() == LifecycleState::PersistentNew)
            .map(|sm| sm.id())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let starts: Vec<ObjectId> = match only {
            Some(id) => vec![id],
            None => self
                .objects
                .keys()
                .copied()
                .filter(|id| pending.contains(id))
                .collect(),
        };

        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for id in starts {
            self.insert_order(id, &pending, &mut visited, &mut order);
        }
        for id in &order {
            self.insert_object(*id)?;
        }
        Ok(order.len())
    }

    fn insert_object(&mut self, id: ObjectId) -> Result<(), EngineError> {
        let class = self.class_of(id)?;
        let all: Vec<usize> = (0..class.field_count()).collect();
        self.ensure_loaded(id, &all)?;

        for meta in class.fields() {
            let Some(strategy) = &meta.value_strategy else {
                continue;
            };
            if self.sm(id)?.field_data(meta.number) != Some(FieldData::null()) {
                continue;
            }
            let member = format!("{}.{}", class.name, meta.name);
            let generated = self.runtime.generators().next_value(
                &member,
                strategy,
                self.backend.sequence_source(),
            )?;
            let value = generated.convert_to(meta.value_type).ok_or_else(|| {
                EngineError::ValueConversion {
                    member: member.clone(),
                    value: format!("{generated:?}"),
                }
            })?;
            self.sm_mut(id)?.install(meta.number, FieldSlot::Value(value));
        }

        let version = class.versioned.then_some(1);
        let record = ObjectRecord {
            object_id: id,
            class_name: class.name.clone(),
            version,
            fields: self.sm(id)?.loaded_data(),
        };
        self.backend.insert(&record)?;

        let sm = self.sm_mut(id)?;
        sm.set_version(version);
        sm.clear_dirty();
        sm.transition(LifecycleEvent::Flush)?;
        debug!(object = %id, class = %class.name, "inserted");
        Ok(())
    }

    fn apply_queue(&mut self) -> Result<usize, EngineError> {
        let mut applied = 0;
        while let Some(op) = self.queue.front().cloned() {
            let Some(sm) = self.objects.get(&op.owner) else {
                self.queue.pop_front();
                continue;
            };
            let class = Arc::clone(sm.class());
            self.backend.apply(&op, &class)?;
            self.queue.pop_front();
            applied += 1;

            if op.kind != OperationKind::ElementRemove || !op.allow_cascade {
                continue;
            }
            let policy = class.member(op.field)?.container_policy();
            let removed = match &op.payload {
                OperationPayload::Element(element)
                | OperationPayload::Indexed { element, .. }
                    if policy.dependent_elements =>
                {
                    element.as_ref_id()
                }
                OperationPayload::Key(key) if policy.dependent_keys => key.as_ref_id(),
                _ => None,
            };
            let Some(target) = removed else {
                continue;
            };
            // Re-added later in the same unit of work: still owned.
            let still_held = self
                .sm(op.owner)?
                .sco(op.field)
                .is_some_and(|sco| sco.contains(&Value::Ref(target)));
            if !still_held {
                debug!(object = %target, op = op.op_type_name(), "cascading queued removal");
                self.delete_dependent(target)?;
            }
        }
        Ok(applied)
    }

    /// Version the backend must still hold for this object.
    fn known_version(
        &mut self,
        id: ObjectId,
        class: &ClassMeta,
    ) -> Result<Option<i64>, EngineError> {
        if !class.versioned {
            return Ok(None);
        }
        if let Some(version) = self.sm(id)?.version() {
            return Ok(Some(version));
        }
        let header = self
            .backend
            .exists(id)?
            .ok_or(EngineError::ObjectNotFound(id))?;
        self.sm_mut(id)?.set_version(header.version);
        Ok(header.version)
    }

    fn flush_updates(&mut self, queued_fields: &HashSet<FieldOwner>) -> Result<usize, EngineError> {
        let dirty: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|sm| sm.lifecycle() == LifecycleState::PersistentDirty)
            .map(|sm| sm.id())
            .collect();

        for id in &dirty {
            let id = *id;
            let class = self.class_of(id)?;
            let expected = self.known_version(id, &class)?;
            let sm = self.sm(id)?;
            let fields: Vec<(usize, FieldData)> = sm
                .dirty_fields()
                .iter_set()
                .filter(|field| !queued_fields.contains(&FieldOwner::new(id, *field)))
                .filter_map(|field| sm.field_data(field).map(|data| (field, data)))
                .collect();
            let version = class.versioned.then(|| expected.unwrap_or(0) + 1);
            let record = ObjectRecord {
                object_id: id,
                class_name: class.name.clone(),
                version,
                fields,
            };
            self.backend.update(&record, expected)?;

            let sm = self.sm_mut(id)?;
            sm.set_version(version);
            sm.clear_dirty();
            sm.transition(LifecycleEvent::Flush)?;
        }
        Ok(dirty.len())
    }

    fn flush_deletes(&mut self) -> Result<usize, EngineError> {
        let doomed: Vec<(ObjectId, LifecycleState)> = self
            .objects
            .values()
            .filter(|sm| sm.lifecycle().is_deleted())
            .map(|sm| (sm.id(), sm.lifecycle()))
            .collect();

        let mut deleted = 0;
        for (id, state) in doomed {
            // New objects deleted before their insert never reach the backend.
            if state == LifecycleState::PersistentDeleted {
                let class = self.class_of(id)?;
                let version = self.known_version(id, &class)?;
                self.backend.delete(id, &class, version)?;
                deleted += 1;
            }
            self.disconnect(id);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Detach / attach
    // ========================================================================

    fn detach_into(&self, id: ObjectId, graph: &mut DetachedGraph) -> Result<(), EngineError> {
        if graph.objects.contains_key(&id) {
            return Ok(());
        }
        let sm = self.sm(id)?;
        if sm.lifecycle().is_deleted() {
            return Ok(());
        }
        let class = sm.class();
        let fields = sm.loaded_data();
        let references: Vec<ObjectId> = fields
            .iter()
            .filter(|(field, _)| class.member(*field).is_ok_and(|m| m.is_relation()))
            .flat_map(|(_, data)| data.references())
            .collect();
        graph.objects.insert(
            id,
            DetachedObject {
                id,
                class_name: class.name.clone(),
                version: sm.version(),
                fields,
            },
        );
        for target in references {
            if self.objects.contains_key(&target) {
                self.detach_into(target, graph)?;
            }
        }
        Ok(())
    }

    /// Copy of the object and everything reachable through its loaded
    /// relation fields. The originals stay managed.
    pub fn detach_copy(&self, id: ObjectId) -> Result<DetachedGraph, EngineError> {
        let mut graph = DetachedGraph::new(id);
        self.detach_into(id, &mut graph)?;
        Ok(graph)
    }

    /// Flush pending work, then hand the object graph out and stop managing it.
    pub fn detach(&mut self, id: ObjectId) -> Result<DetachedGraph, EngineError> {
        if self
            .objects
            .values()
            .any(|sm| sm.lifecycle().is_waiting_for_flush())
        {
            self.flush()?;
        }
        let graph = self.detach_copy(id)?;
        for object_id in graph.objects.keys() {
            let Some(sm) = self.objects.get_mut(object_id) else {
                continue;
            };
            if sm.lifecycle() == LifecycleState::Transient {
                continue;
            }
            sm.transition(LifecycleEvent::Detach)?;
            self.disconnect(*object_id);
        }
        Ok(graph)
    }

    /// Merge a detached graph back in. Objects the backend does not know are
    /// persisted as new. Returns the root id.
    pub fn attach_copy(&mut self, graph: &DetachedGraph) -> Result<ObjectId, EngineError> {
        for id in graph.objects.keys() {
            self.runtime.ownership().check(*id, self.id)?;
        }
        for object in graph.objects.values() {
            self.attach_object(object)?;
        }
        Ok(graph.root)
    }

    fn attach_object(&mut self, object: &DetachedObject) -> Result<(), EngineError> {
        if !self.objects.contains_key(&object.id) {
            match self.backend.exists(object.id)? {
                Some(header) => {
                    let class = self.runtime.class(&header.class_name)?;
                    self.bind_hollow(object.id, class, header.version)?;
                }
                None => {
                    let class = self.runtime.class(&object.class_name)?;
                    let mut sm =
                        self.pool
                            .acquire(object.id, Arc::clone(&class), LifecycleState::Transient);
                    for meta in class.fields() {
                        let slot =
                            self.make_slot(object.id, meta, object.field(meta.number).cloned())?;
                        sm.install(meta.number, slot);
                    }
                    self.objects.insert(object.id, sm);
                    return self.make_persistent(object.id, true);
                }
            }
        }

        let sm = self.sm(object.id)?;
        if sm.lifecycle().is_deleted() {
            return Ok(());
        }
        let class = Arc::clone(sm.class());
        let fields: Vec<usize> = object.fields.iter().map(|(field, _)| *field).collect();
        self.ensure_loaded(object.id, &fields)?;
        if class.versioned && object.version.is_some() {
            self.sm_mut(object.id)?.set_version(object.version);
        }

        for (field, data) in &object.fields {
            if class.member(*field)?.is_sco() {
                self.with_sco_mut(object.id, *field, |sco, host| sco.attach_copy(host, data))?;
            } else if self.sm(object.id)?.field_data(*field).as_ref() != Some(data) {
                self.set_field(object.id, *field, data.clone())?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Reachability / close
    // ========================================================================

    pub fn reachable_from(&mut self, id: ObjectId) -> Result<HashSet<ObjectId>, EngineError> {
        let mut reachable = HashSet::new();
        ReachabilityWalker::reach(id, self, &mut reachable)?;
        Ok(reachable)
    }

    /// Disconnect every managed object and release their ids. An open
    /// transaction is rolled back.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.tx_active {
            self.tx_active = false;
            self.backend.rollback()?;
        }
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        self.queue.clear();
        self.relations.clear();
        self.runtime.ownership().release_all(self.id);
        debug!(context = %self.id, "context closed");
        Ok(())
    }
}

impl ReachabilityScope for ExecutionContext {
    fn state_of(&self, id: ObjectId) -> Option<LifecycleState> {
        self.lifecycle(id)
    }

    fn is_enlisted(&self, id: ObjectId) -> bool {
        self.tx_active
            && self.objects.get(&id).is_some_and(|sm| {
                matches!(
                    sm.lifecycle(),
                    LifecycleState::PersistentNew
                        | LifecycleState::PersistentClean
                        | LifecycleState::PersistentDirty
                )
            })
    }

    fn load_unloaded_relation_fields(&mut self, id: ObjectId) -> Result<(), EngineError> {
        ExecutionContext::load_unloaded_relation_fields(self, id)
    }

    fn cascade_targets(&self, id: ObjectId) -> Vec<ObjectId> {
        let Some(sm) = self.objects.get(&id) else {
            return Vec::new();
        };
        let fields: Vec<usize> = sm
            .class()
            .fields()
            .iter()
            .filter(|meta| meta.is_relation() && meta.cascade_persist)
            .map(|meta| meta.number)
            .collect();
        sm.references_in(&fields)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.runtime.ownership().release_all(self.id);
    }
}
