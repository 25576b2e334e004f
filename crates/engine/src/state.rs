use std::sync::Arc;

use objstate_core::{
    ClassMeta, CoreError, FieldBitmap, FieldData, LifecycleEvent, LifecycleState, ObjectId, Value,
};

use crate::sco::Sco;

#[derive(Debug)]
pub enum FieldSlot {
    Unloaded,
    Value(Value),
    Sco(Sco),
}

/// Lifecycle, loaded/dirty tracking and field storage for one managed object.
#[derive(Debug)]
pub struct StateManager {
    id: ObjectId,
    class: Arc<ClassMeta>,
    lifecycle: LifecycleState,
    loaded: FieldBitmap,
    dirty: FieldBitmap,
    version: Option<i64>,
    slots: Vec<FieldSlot>,
    bound: bool,
    /// Persisted by an explicit call rather than by cascade.
    pub(crate) explicitly_persisted: bool,
    /// Made persistent inside the current transaction.
    pub(crate) created_in_tx: bool,
}

impl StateManager {
    pub fn new(id: ObjectId, class: Arc<ClassMeta>, lifecycle: LifecycleState) -> Self {
        let count = class.field_count();
        Self {
            id,
            class,
            lifecycle,
            loaded: FieldBitmap::new(count),
            dirty: FieldBitmap::new(count),
            version: None,
            slots: (0..count).map(|_| FieldSlot::Unloaded).collect(),
            bound: true,
            explicitly_persisted: false,
            created_in_tx: false,
        }
    }

    /// Re-initialise a pooled instance for another object.
    fn rebind(&mut self, id: ObjectId, class: Arc<ClassMeta>, lifecycle: LifecycleState) {
        let count = class.field_count();
        self.id = id;
        self.class = class;
        self.lifecycle = lifecycle;
        self.loaded = FieldBitmap::new(count);
        self.dirty = FieldBitmap::new(count);
        self.version = None;
        self.slots.clear();
        self.slots.resize_with(count, || FieldSlot::Unloaded);
        self.bound = true;
        self.explicitly_persisted = false;
        self.created_in_tx = false;
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class(&self) -> &Arc<ClassMeta> {
        &self.class
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_loaded(&self, field: usize) -> bool {
        self.loaded.get(field)
    }

    pub fn loaded_fields(&self) -> &FieldBitmap {
        &self.loaded
    }

    pub fn dirty_fields(&self) -> &FieldBitmap {
        &self.dirty
    }

    pub fn transition(&mut self, event: LifecycleEvent) -> Result<LifecycleState, CoreError> {
        self.lifecycle = self.lifecycle.transition(event)?;
        Ok(self.lifecycle)
    }

    /// Idempotent. Silently ignored once the manager is disconnected, and in
    /// states that do not accept writes.
    pub fn make_dirty(&mut self, field: usize) {
        if !self.bound {
            return;
        }
        let Ok(next) = self.lifecycle.transition(LifecycleEvent::WriteField) else {
            return;
        };
        self.lifecycle = next;
        self.dirty.set(field);
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear_all();
    }

    pub fn slot(&self, field: usize) -> Option<&FieldSlot> {
        self.slots.get(field)
    }

    pub fn slot_mut(&mut self, field: usize) -> Option<&mut FieldSlot> {
        self.slots.get_mut(field)
    }

    /// Install a loaded value and set its loaded bit.
    pub fn install(&mut self, field: usize, slot: FieldSlot) {
        if let Some(existing) = self.slots.get_mut(field) {
            if let FieldSlot::Sco(old) = existing {
                old.unset_owner();
            }
            *existing = slot;
            self.loaded.set(field);
        }
    }

    /// Temporarily move a wrapper out of its slot. The loaded bit is kept.
    pub(crate) fn take_sco(&mut self, field: usize) -> Option<Sco> {
        let slot = self.slots.get_mut(field)?;
        match std::mem::replace(slot, FieldSlot::Unloaded) {
            FieldSlot::Sco(sco) => Some(sco),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn restore_sco(&mut self, field: usize, sco: Sco) {
        if let Some(slot) = self.slots.get_mut(field) {
            *slot = FieldSlot::Sco(sco);
        }
    }

    pub fn sco(&self, field: usize) -> Option<&Sco> {
        match self.slots.get(field)? {
            FieldSlot::Sco(sco) => Some(sco),
            _ => None,
        }
    }

    /// Current content of a loaded field.
    pub fn field_data(&self, field: usize) -> Option<FieldData> {
        if !self.loaded.get(field) {
            return None;
        }
        match self.slots.get(field)? {
            FieldSlot::Unloaded => None,
            FieldSlot::Value(value) => Some(FieldData::Scalar(value.clone())),
            FieldSlot::Sco(sco) => Some(sco.detach_copy()),
        }
    }

    pub fn loaded_data(&self) -> Vec<(usize, FieldData)> {
        self.loaded
            .iter_set()
            .filter_map(|field| self.field_data(field).map(|data| (field, data)))
            .collect()
    }

    /// References held by loaded fields among `fields`.
    pub fn references_in(&self, fields: &[usize]) -> Vec<ObjectId> {
        fields
            .iter()
            .filter_map(|f| self.field_data(*f))
            .flat_map(|data| data.references())
            .collect()
    }

    /// Detach every wrapper from this object. Loaded content stays readable.
    pub fn unset_wrapper_owners(&mut self) {
        for slot in &mut self.slots {
            if let FieldSlot::Sco(sco) = slot {
                sco.unset_owner();
            }
        }
    }

    /// Drop every loaded value, leaving the object hollow.
    pub fn unload_all(&mut self) {
        for slot in &mut self.slots {
            if let FieldSlot::Sco(sco) = slot {
                sco.unset_owner();
            }
            *slot = FieldSlot::Unloaded;
        }
        self.loaded.clear_all();
        self.dirty.clear_all();
    }

    /// Release wrappers and mark the manager unusable until rebound.
    pub fn disconnect(&mut self) {
        self.unload_all();
        self.bound = false;
        self.explicitly_persisted = false;
        self.created_in_tx = false;
    }
}

/// Bounded free list of state managers.
pub struct StateManagerPool {
    free: Vec<StateManager>,
    capacity: usize,
    reused: usize,
}

impl StateManagerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
            reused: 0,
        }
    }

    pub fn acquire(
        &mut self,
        id: ObjectId,
        class: Arc<ClassMeta>,
        lifecycle: LifecycleState,
    ) -> StateManager {
        match self.free.pop() {
            Some(mut sm) => {
                sm.rebind(id, class, lifecycle);
                self.reused += 1;
                sm
            }
            None => StateManager::new(id, class, lifecycle),
        }
    }

    pub fn release(&mut self, mut sm: StateManager) {
        sm.disconnect();
        if self.free.len() < self.capacity {
            self.free.push(sm);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reuse_count(&self) -> usize {
        self.reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::{FieldMeta, ValueType};

    fn class() -> Arc<ClassMeta> {
        Arc::new(
            ClassMeta::new("Note")
                .field(FieldMeta::scalar("title", ValueType::Text))
                .field(FieldMeta::scalar("body", ValueType::Text)),
        )
    }

    #[test]
    fn make_dirty_is_idempotent() {
        let mut sm = StateManager::new(ObjectId::new(), class(), LifecycleState::PersistentClean);
        sm.make_dirty(1);
        let after_first = (sm.lifecycle(), sm.dirty_fields().clone());
        sm.make_dirty(1);
        assert_eq!((sm.lifecycle(), sm.dirty_fields().clone()), after_first);
        assert_eq!(sm.lifecycle(), LifecycleState::PersistentDirty);
        assert_eq!(sm.dirty_fields().count(), 1);
    }

    #[test]
    fn make_dirty_on_disconnected_manager_is_noop() {
        let mut sm = StateManager::new(ObjectId::new(), class(), LifecycleState::PersistentClean);
        sm.disconnect();
        sm.make_dirty(0);
        assert!(!sm.dirty_fields().any());
        assert_eq!(sm.lifecycle(), LifecycleState::PersistentClean);
    }

    #[test]
    fn deleted_manager_ignores_make_dirty() {
        let mut sm = StateManager::new(ObjectId::new(), class(), LifecycleState::PersistentClean);
        sm.transition(LifecycleEvent::Delete).unwrap();
        sm.make_dirty(0);
        assert!(!sm.dirty_fields().any());
        assert_eq!(sm.lifecycle(), LifecycleState::PersistentDeleted);
    }

    #[test]
    fn hollow_write_goes_dirty() {
        let mut sm = StateManager::new(ObjectId::new(), class(), LifecycleState::Hollow);
        sm.install(0, FieldSlot::Value(Value::Text("t".into())));
        sm.make_dirty(0);
        assert_eq!(sm.lifecycle(), LifecycleState::PersistentDirty);
        assert_eq!(sm.field_data(0), Some(FieldData::Scalar(Value::Text("t".into()))));
        assert_eq!(sm.field_data(1), None);
    }

    #[test]
    fn pool_reuses_up_to_capacity() {
        let mut pool = StateManagerPool::new(1);
        let a = pool.acquire(ObjectId::new(), class(), LifecycleState::Hollow);
        let b = pool.acquire(ObjectId::new(), class(), LifecycleState::Hollow);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.len(), 1);

        let id = ObjectId::new();
        let c = pool.acquire(id, class(), LifecycleState::Transient);
        assert_eq!(pool.reuse_count(), 1);
        assert_eq!(c.id(), id);
        assert!(c.is_bound());
        assert!(!c.loaded_fields().any());
    }
}
