use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use tracing::debug;

use objstate_core::{
    ContainerPolicy, ContainerShape, FieldData, FieldOwner, Value,
    operations::{Operation, OperationPayload},
};

use super::{ScoHost, bound, changed, check_nullable};
use crate::error::EngineError;

pub trait MapDelegate: Default + fmt::Debug {
    const SHAPE: ContainerShape;

    fn from_entries(entries: Vec<(Value, Value)>) -> Self;

    fn put(&mut self, key: Value, value: Value) -> Option<Value>;

    fn take(&mut self, key: &Value) -> Option<Value>;

    fn lookup(&self, key: &Value) -> Option<&Value>;

    fn size(&self) -> usize;

    fn entries(&self) -> Vec<(Value, Value)>;

    fn clear_all(&mut self);
}

impl MapDelegate for IndexMap<Value, Value> {
    const SHAPE: ContainerShape = ContainerShape::Map;

    fn from_entries(entries: Vec<(Value, Value)>) -> Self {
        entries.into_iter().collect()
    }

    fn put(&mut self, key: Value, value: Value) -> Option<Value> {
        self.insert(key, value)
    }

    fn take(&mut self, key: &Value) -> Option<Value> {
        self.shift_remove(key)
    }

    fn lookup(&self, key: &Value) -> Option<&Value> {
        self.get(key)
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn entries(&self) -> Vec<(Value, Value)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn clear_all(&mut self) {
        self.clear()
    }
}

impl MapDelegate for BTreeMap<Value, Value> {
    const SHAPE: ContainerShape = ContainerShape::SortedMap;

    fn from_entries(entries: Vec<(Value, Value)>) -> Self {
        entries.into_iter().collect()
    }

    fn put(&mut self, key: Value, value: Value) -> Option<Value> {
        self.insert(key, value)
    }

    fn take(&mut self, key: &Value) -> Option<Value> {
        self.remove(key)
    }

    fn lookup(&self, key: &Value) -> Option<&Value> {
        self.get(key)
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn entries(&self) -> Vec<(Value, Value)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn clear_all(&mut self) {
        self.clear()
    }
}

#[derive(Debug)]
pub struct MapWrapper<D> {
    owner: Option<FieldOwner>,
    policy: ContainerPolicy,
    delegate: D,
}

pub type HashMapWrapper = MapWrapper<IndexMap<Value, Value>>;
pub type SortedMapWrapper = MapWrapper<BTreeMap<Value, Value>>;

impl<D: MapDelegate> MapWrapper<D> {
    pub fn new(
        owner: FieldOwner,
        policy: ContainerPolicy,
        initial: Option<Vec<(Value, Value)>>,
    ) -> Self {
        let delegate = initial.map(D::from_entries).unwrap_or_default();
        debug!(
            object = %owner.object,
            field = owner.field,
            shape = D::SHAPE.as_str(),
            size = delegate.size(),
            allow_nulls = policy.allow_nulls,
            "map wrapper initialised"
        );
        Self {
            owner: Some(owner),
            policy,
            delegate,
        }
    }

    pub fn owner(&self) -> Option<FieldOwner> {
        self.owner
    }

    pub fn unset_owner(&mut self) {
        self.owner = None;
    }

    pub fn len(&self) -> usize {
        self.delegate.size()
    }

    pub fn is_empty(&self) -> bool {
        self.delegate.size() == 0
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.delegate.lookup(key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.delegate.lookup(key).is_some()
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.delegate.entries()
    }

    fn validate(&self, key: &Value, value: &Value) -> Result<(), EngineError> {
        if key.is_null() {
            return Err(EngineError::InvalidElement("map keys cannot be null".to_string()));
        }
        check_nullable(self.policy.allow_nulls, value)
    }

    /// Put without dirtying. Returns the previous value and whether the map changed.
    fn put_entry(
        &mut self,
        host: &mut dyn ScoHost,
        owner: FieldOwner,
        key: Value,
        value: Value,
    ) -> (Option<Value>, bool) {
        let previous = self.delegate.put(key.clone(), value.clone());
        let changed = previous.as_ref() != Some(&value);
        if host.manage_relations() {
            if let Some(old) = previous.as_ref().filter(|old| **old != value) {
                host.relation_remove(owner, old);
            }
            host.relation_add(owner, &value);
        }
        if changed {
            if host.queue_active(owner) {
                host.enqueue(Operation::add(owner, OperationPayload::Entry { key, value }));
            }
            // Replaced values are owned by the map only while they are in it.
            if let Some(old) = previous.as_ref() {
                if self.policy.dependent_values && old.is_persistable() {
                    host.delete_dependent(old);
                }
            }
        }
        (previous, changed)
    }

    /// Remove without dirtying.
    fn remove_entry(
        &mut self,
        host: &mut dyn ScoHost,
        owner: FieldOwner,
        key: &Value,
        allow_cascade: bool,
    ) -> Option<Value> {
        let value = self.delegate.take(key)?;
        if host.manage_relations() {
            host.relation_remove(owner, &value);
        }
        if host.queue_active(owner) {
            host.enqueue(Operation::remove(
                owner,
                OperationPayload::Key(key.clone()),
                allow_cascade,
            ));
        } else if allow_cascade && self.policy.dependent_keys && key.is_persistable() {
            host.delete_dependent(key);
        }
        // The queued payload names the key only, so values cascade here.
        if allow_cascade && self.policy.dependent_values && value.is_persistable() {
            host.delete_dependent(&value);
        }
        Some(value)
    }

    pub fn put(
        &mut self,
        host: &mut dyn ScoHost,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>, EngineError> {
        let owner = bound(self.owner)?;
        self.validate(&key, &value)?;
        let (previous, did_change) = self.put_entry(host, owner, key, value);
        if did_change {
            changed(host, owner);
        }
        Ok(previous)
    }

    pub fn put_all(
        &mut self,
        host: &mut dyn ScoHost,
        entries: Vec<(Value, Value)>,
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        for (key, value) in &entries {
            self.validate(key, value)?;
        }
        let mut any = false;
        for (key, value) in entries {
            any |= self.put_entry(host, owner, key, value).1;
        }
        if any {
            changed(host, owner);
        }
        Ok(any)
    }

    pub fn remove(
        &mut self,
        host: &mut dyn ScoHost,
        key: &Value,
    ) -> Result<Option<Value>, EngineError> {
        let owner = bound(self.owner)?;
        let removed = self.remove_entry(host, owner, key, true);
        if removed.is_some() {
            changed(host, owner);
        }
        Ok(removed)
    }

    pub fn retain_keys(
        &mut self,
        host: &mut dyn ScoHost,
        keep: &[Value],
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        let doomed: Vec<Value> = self
            .delegate
            .entries()
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| !keep.contains(k))
            .collect();
        for key in &doomed {
            self.remove_entry(host, owner, key, true);
        }
        if !doomed.is_empty() {
            changed(host, owner);
        }
        Ok(!doomed.is_empty())
    }

    pub fn clear(&mut self, host: &mut dyn ScoHost) -> Result<(), EngineError> {
        let owner = bound(self.owner)?;
        for (key, _) in self.delegate.entries() {
            self.remove_entry(host, owner, &key, true);
        }
        self.delegate.clear_all();
        changed(host, owner);
        Ok(())
    }

    pub fn detach_copy(&self) -> FieldData {
        FieldData::Map(self.delegate.entries())
    }

    pub fn attach_copy(
        &mut self,
        host: &mut dyn ScoHost,
        detached: &[(Value, Value)],
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        for (key, value) in detached {
            self.validate(key, value)?;
        }
        let stale: Vec<Value> = self
            .delegate
            .entries()
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| !detached.iter().any(|(dk, _)| dk == k))
            .collect();

        let mut any = false;
        for key in &stale {
            any |= self.remove_entry(host, owner, key, false).is_some();
        }
        for (key, value) in detached {
            if self.delegate.lookup(key) != Some(value) {
                any |= self.put_entry(host, owner, key.clone(), value.clone()).1;
            }
        }
        if any {
            changed(host, owner);
        }
        Ok(any)
    }
}
