use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexSet;
use tracing::debug;

use objstate_core::{
    ContainerPolicy, ContainerShape, FieldData, FieldOwner, Value,
    operations::{Operation, OperationPayload},
};

use super::{ScoHost, bound, changed, check_nullable};
use crate::error::EngineError;

/// The unwrapped container behind a [`CollectionWrapper`].
pub trait CollectionDelegate: Default + fmt::Debug {
    const SHAPE: ContainerShape;

    fn from_values(values: Vec<Value>) -> Self;

    /// Returns whether the container changed.
    fn insert(&mut self, element: Value) -> bool;

    /// Removes one occurrence. Returns whether it was present.
    fn remove(&mut self, element: &Value) -> bool;

    fn contains(&self, element: &Value) -> bool;

    fn len(&self) -> usize;

    /// Elements in iteration order.
    fn values(&self) -> Vec<Value>;

    fn clear(&mut self);
}

impl CollectionDelegate for IndexSet<Value> {
    const SHAPE: ContainerShape = ContainerShape::Set;

    fn from_values(values: Vec<Value>) -> Self {
        values.into_iter().collect()
    }

    fn insert(&mut self, element: Value) -> bool {
        IndexSet::insert(self, element)
    }

    fn remove(&mut self, element: &Value) -> bool {
        self.shift_remove(element)
    }

    fn contains(&self, element: &Value) -> bool {
        IndexSet::contains(self, element)
    }

    fn len(&self) -> usize {
        IndexSet::len(self)
    }

    fn values(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    fn clear(&mut self) {
        IndexSet::clear(self)
    }
}

impl CollectionDelegate for BTreeSet<Value> {
    const SHAPE: ContainerShape = ContainerShape::SortedSet;

    fn from_values(values: Vec<Value>) -> Self {
        values.into_iter().collect()
    }

    fn insert(&mut self, element: Value) -> bool {
        BTreeSet::insert(self, element)
    }

    fn remove(&mut self, element: &Value) -> bool {
        BTreeSet::remove(self, element)
    }

    fn contains(&self, element: &Value) -> bool {
        BTreeSet::contains(self, element)
    }

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }

    fn values(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    fn clear(&mut self) {
        BTreeSet::clear(self)
    }
}

impl CollectionDelegate for Vec<Value> {
    const SHAPE: ContainerShape = ContainerShape::List;

    fn from_values(values: Vec<Value>) -> Self {
        values
    }

    fn insert(&mut self, element: Value) -> bool {
        self.push(element);
        true
    }

    fn remove(&mut self, element: &Value) -> bool {
        match self.iter().position(|e| e == element) {
            Some(index) => {
                Vec::remove(self, index);
                true
            }
            None => false,
        }
    }

    fn contains(&self, element: &Value) -> bool {
        self.as_slice().contains(element)
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn values(&self) -> Vec<Value> {
        self.clone()
    }

    fn clear(&mut self) {
        Vec::clear(self)
    }
}

/// List kept in value order. Duplicates are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortedVec(Vec<Value>);

impl SortedVec {
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }
}

impl CollectionDelegate for SortedVec {
    const SHAPE: ContainerShape = ContainerShape::OrderedList;

    fn from_values(mut values: Vec<Value>) -> Self {
        values.sort();
        SortedVec(values)
    }

    fn insert(&mut self, element: Value) -> bool {
        let index = self.0.partition_point(|e| e <= &element);
        self.0.insert(index, element);
        true
    }

    fn remove(&mut self, element: &Value) -> bool {
        match self.0.binary_search(element) {
            Ok(_) => {
                let first = self.0.partition_point(|e| e < element);
                self.0.remove(first);
                true
            }
            Err(_) => false,
        }
    }

    fn contains(&self, element: &Value) -> bool {
        self.0.binary_search(element).is_ok()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn values(&self) -> Vec<Value> {
        self.0.clone()
    }

    fn clear(&mut self) {
        self.0.clear()
    }
}

#[derive(Debug)]
pub struct CollectionWrapper<D> {
    owner: Option<FieldOwner>,
    policy: ContainerPolicy,
    delegate: D,
}

pub type SetWrapper = CollectionWrapper<IndexSet<Value>>;
pub type SortedSetWrapper = CollectionWrapper<BTreeSet<Value>>;
pub type ListWrapper = CollectionWrapper<Vec<Value>>;
pub type OrderedListWrapper = CollectionWrapper<SortedVec>;

impl<D: CollectionDelegate> CollectionWrapper<D> {
    pub fn new(owner: FieldOwner, policy: ContainerPolicy, initial: Option<Vec<Value>>) -> Self {
        let delegate = initial.map(D::from_values).unwrap_or_default();
        debug!(
            object = %owner.object,
            field = owner.field,
            shape = D::SHAPE.as_str(),
            size = delegate.len(),
            allow_nulls = policy.allow_nulls,
            "collection wrapper initialised"
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

    pub fn policy(&self) -> ContainerPolicy {
        self.policy
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn len(&self) -> usize {
        self.delegate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegate.len() == 0
    }

    pub fn contains(&self, element: &Value) -> bool {
        self.delegate.contains(element)
    }

    pub fn values(&self) -> Vec<Value> {
        self.delegate.values()
    }

    /// Queue the removal, or delete a dependent element right away.
    fn cascade_removal(
        &self,
        host: &mut dyn ScoHost,
        owner: FieldOwner,
        payload: OperationPayload,
        element: &Value,
        allow_cascade: bool,
    ) {
        if host.queue_active(owner) {
            host.enqueue(Operation::remove(owner, payload, allow_cascade));
        } else if allow_cascade && self.policy.dependent_elements && element.is_persistable() {
            host.delete_dependent(element);
        }
    }

    /// Remove each element without marking dirty. Returns whether any was present.
    fn remove_each(
        &mut self,
        host: &mut dyn ScoHost,
        owner: FieldOwner,
        elements: &[Value],
        allow_cascade: bool,
    ) -> bool {
        let mut any = false;
        for element in elements {
            let present = self.delegate.remove(element);
            if host.manage_relations() {
                host.relation_remove(owner, element);
            }
            if present {
                self.cascade_removal(
                    host,
                    owner,
                    OperationPayload::Element(element.clone()),
                    element,
                    allow_cascade,
                );
                any = true;
            }
        }
        any
    }

    pub fn add(&mut self, host: &mut dyn ScoHost, element: Value) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        check_nullable(self.policy.allow_nulls, &element)?;

        let inserted = self.delegate.insert(element.clone());
        if host.manage_relations() {
            host.relation_add(owner, &element);
        }
        if inserted {
            if host.queue_active(owner) {
                host.enqueue(Operation::add(owner, OperationPayload::Element(element)));
            }
            changed(host, owner);
        }
        Ok(inserted)
    }

    pub fn add_all(
        &mut self,
        host: &mut dyn ScoHost,
        elements: Vec<Value>,
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        for element in &elements {
            check_nullable(self.policy.allow_nulls, element)?;
        }

        let queued = host.queue_active(owner);
        let mut any = false;
        for element in elements {
            let inserted = self.delegate.insert(element.clone());
            if host.manage_relations() {
                host.relation_add(owner, &element);
            }
            if inserted {
                if queued {
                    host.enqueue(Operation::add(owner, OperationPayload::Element(element)));
                }
                any = true;
            }
        }
        if any {
            changed(host, owner);
        }
        Ok(any)
    }

    pub fn remove(
        &mut self,
        host: &mut dyn ScoHost,
        element: &Value,
        allow_cascade: bool,
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        let present = self.remove_each(host, owner, std::slice::from_ref(element), allow_cascade);
        if present {
            changed(host, owner);
        }
        Ok(present)
    }

    /// An empty input changes nothing and reports success.
    pub fn remove_all(
        &mut self,
        host: &mut dyn ScoHost,
        elements: &[Value],
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        if elements.is_empty() {
            return Ok(true);
        }
        let any = self.remove_each(host, owner, elements, true);
        if any {
            changed(host, owner);
        }
        Ok(any)
    }

    pub fn retain_all(
        &mut self,
        host: &mut dyn ScoHost,
        keep: &[Value],
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        let complement: Vec<Value> = self
            .delegate
            .values()
            .into_iter()
            .filter(|element| !keep.contains(element))
            .collect();
        let any = self.remove_each(host, owner, &complement, true);
        if any {
            changed(host, owner);
        }
        Ok(any)
    }

    pub fn clear(&mut self, host: &mut dyn ScoHost) -> Result<(), EngineError> {
        let owner = bound(self.owner)?;
        let captured = self.delegate.values();
        for element in &captured {
            if host.manage_relations() {
                host.relation_remove(owner, element);
            }
            self.cascade_removal(
                host,
                owner,
                OperationPayload::Element(element.clone()),
                element,
                true,
            );
        }
        self.delegate.clear();
        changed(host, owner);
        Ok(())
    }

    pub fn detach_copy(&self) -> FieldData {
        FieldData::Collection(self.delegate.values())
    }

    /// Bring the wrapper in line with a detached copy. Stale elements are
    /// removed without cascading.
    pub fn attach_copy(
        &mut self,
        host: &mut dyn ScoHost,
        detached: &[Value],
    ) -> Result<bool, EngineError> {
        let owner = bound(self.owner)?;
        let stale: Vec<Value> = self
            .delegate
            .values()
            .into_iter()
            .filter(|element| !detached.contains(element))
            .collect();
        let fresh: Vec<Value> = detached
            .iter()
            .filter(|element| !self.delegate.contains(element))
            .cloned()
            .collect();

        let removed = self.remove_each(host, owner, &stale, false);
        if removed {
            changed(host, owner);
        }
        let added = if fresh.is_empty() {
            false
        } else {
            self.add_all(host, fresh)?
        };
        Ok(removed || added)
    }
}

impl ListWrapper {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.delegate.get(index)
    }

    pub fn insert(
        &mut self,
        host: &mut dyn ScoHost,
        index: usize,
        element: Value,
    ) -> Result<(), EngineError> {
        let owner = bound(self.owner)?;
        let len = self.delegate.len();
        if index > len {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }
        check_nullable(self.policy.allow_nulls, &element)?;

        self.delegate.insert(index, element.clone());
        if host.manage_relations() {
            host.relation_add(owner, &element);
        }
        if host.queue_active(owner) {
            host.enqueue(Operation::add(
                owner,
                OperationPayload::Indexed { index, element },
            ));
        }
        changed(host, owner);
        Ok(())
    }

    /// Replace the element at `index`, returning the previous one.
    pub fn set(
        &mut self,
        host: &mut dyn ScoHost,
        index: usize,
        element: Value,
        allow_cascade: bool,
    ) -> Result<Value, EngineError> {
        let owner = bound(self.owner)?;
        let len = self.delegate.len();
        if index >= len {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }
        check_nullable(self.policy.allow_nulls, &element)?;

        let previous = std::mem::replace(&mut self.delegate[index], element.clone());
        if host.manage_relations() {
            host.relation_remove(owner, &previous);
            host.relation_add(owner, &element);
        }
        if host.queue_active(owner) {
            host.enqueue(Operation::remove(
                owner,
                OperationPayload::Indexed {
                    index,
                    element: previous.clone(),
                },
                allow_cascade,
            ));
            host.enqueue(Operation::add(
                owner,
                OperationPayload::Indexed { index, element },
            ));
        } else if allow_cascade
            && self.policy.dependent_elements
            && previous.is_persistable()
            && previous != self.delegate[index]
        {
            host.delete_dependent(&previous);
        }
        changed(host, owner);
        Ok(previous)
    }

    pub fn remove_at(
        &mut self,
        host: &mut dyn ScoHost,
        index: usize,
    ) -> Result<Value, EngineError> {
        let owner = bound(self.owner)?;
        let len = self.delegate.len();
        if index >= len {
            return Err(EngineError::IndexOutOfBounds { index, len });
        }

        let removed = self.delegate.remove(index);
        if host.manage_relations() {
            host.relation_remove(owner, &removed);
        }
        self.cascade_removal(
            host,
            owner,
            OperationPayload::Indexed {
                index,
                element: removed.clone(),
            },
            &removed,
            true,
        );
        changed(host, owner);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sco::testing::RecordingHost;
    use objstate_core::{ObjectId, operations::OperationKind};

    fn owner() -> FieldOwner {
        FieldOwner::new(ObjectId::new(), 1)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn set_of(items: &[&str]) -> SetWrapper {
        SetWrapper::new(
            owner(),
            ContainerPolicy {
                allow_nulls: true,
                ..Default::default()
            },
            Some(items.iter().map(|s| text(s)).collect()),
        )
    }

    fn dependent_policy() -> ContainerPolicy {
        ContainerPolicy {
            allow_nulls: true,
            dependent_elements: true,
            elements_have_identity: true,
            ..Default::default()
        }
    }

    // ========================================================================
    // Set semantics
    // ========================================================================

    #[test]
    fn mutations_match_plain_container() {
        let mut wrapper = set_of(&[]);
        let mut plain: IndexSet<Value> = IndexSet::new();
        let mut host = RecordingHost::immediate();

        let script: &[(bool, &str)] = &[
            (true, "a"),
            (true, "b"),
            (true, "a"),
            (false, "c"),
            (true, "c"),
            (false, "a"),
            (true, "d"),
            (false, "b"),
            (true, "a"),
        ];
        for (is_add, item) in script {
            let element = text(item);
            if *is_add {
                assert_eq!(wrapper.add(&mut host, element.clone()).unwrap(), plain.insert(element));
            } else {
                assert_eq!(
                    wrapper.remove(&mut host, &element, true).unwrap(),
                    plain.shift_remove(&element)
                );
            }
        }
        assert_eq!(wrapper.values(), plain.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_add_does_not_dirty() {
        let mut wrapper = set_of(&["a"]);
        let mut host = RecordingHost::queued();
        assert!(!wrapper.add(&mut host, text("a")).unwrap());
        assert!(host.dirty_calls.is_empty());
        assert!(host.ops.is_empty());
        // relation bookkeeping still sees the element
        assert_eq!(host.relation_adds, vec![text("a")]);
    }

    #[test]
    fn null_rejected_without_side_effects() {
        let mut wrapper = SetWrapper::new(owner(), ContainerPolicy::default(), None);
        let mut host = RecordingHost::queued();
        let err = wrapper.add(&mut host, Value::Null).unwrap_err();
        assert!(matches!(err, EngineError::InvalidElement(_)));

        let err = wrapper
            .add_all(&mut host, vec![text("ok"), Value::Null])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidElement(_)));
        assert!(wrapper.is_empty());
        assert!(host.dirty_calls.is_empty());
        assert!(host.ops.is_empty());
    }

    #[test]
    fn unbound_wrapper_rejects_mutation() {
        let mut wrapper = set_of(&["a"]);
        wrapper.unset_owner();
        let mut host = RecordingHost::immediate();
        assert!(matches!(
            wrapper.add(&mut host, text("b")),
            Err(EngineError::Unbound)
        ));
        assert!(matches!(wrapper.clear(&mut host), Err(EngineError::Unbound)));
        assert_eq!(wrapper.values(), vec![text("a")]);
    }

    #[test]
    fn retain_all_queues_cascading_removals_and_dirties_once() {
        let mut wrapper = set_of(&["a", "b", "c"]);
        let mut host = RecordingHost::queued();

        assert!(wrapper.retain_all(&mut host, &[text("b")]).unwrap());
        assert_eq!(wrapper.values(), vec![text("b")]);
        assert_eq!(host.dirty_calls.len(), 1);
        assert_eq!(host.ops.len(), 2);
        for op in &host.ops {
            assert_eq!(op.kind, OperationKind::ElementRemove);
            assert!(op.allow_cascade);
        }
    }

    #[test]
    fn remove_all_empty_input_is_true() {
        let mut wrapper = set_of(&["a"]);
        let mut host = RecordingHost::immediate();
        assert!(wrapper.remove_all(&mut host, &[]).unwrap());
        assert!(host.dirty_calls.is_empty());
        assert!(!wrapper.remove_all(&mut host, &[text("zz")]).unwrap());
    }

    #[test]
    fn remove_of_absent_element_queues_nothing() {
        let mut wrapper = set_of(&["a"]);
        let mut host = RecordingHost::queued();
        assert!(!wrapper.remove(&mut host, &text("b"), true).unwrap());
        assert!(host.ops.is_empty());
        assert!(host.dirty_calls.is_empty());
    }

    // ========================================================================
    // Cascade
    // ========================================================================

    #[test]
    fn immediate_remove_deletes_dependent_element() {
        let target = Value::Ref(ObjectId::new());
        let mut wrapper = SetWrapper::new(owner(), dependent_policy(), Some(vec![target.clone()]));
        let mut host = RecordingHost::immediate();

        wrapper.remove(&mut host, &target, true).unwrap();
        assert_eq!(host.deletes, vec![target.clone()]);
        assert!(host.ops.is_empty());
    }

    #[test]
    fn remove_without_cascade_keeps_dependent_element() {
        let target = Value::Ref(ObjectId::new());
        let mut wrapper = SetWrapper::new(owner(), dependent_policy(), Some(vec![target.clone()]));
        let mut host = RecordingHost::immediate();
        wrapper.remove(&mut host, &target, false).unwrap();
        assert!(host.deletes.is_empty());

        let mut wrapper = SetWrapper::new(owner(), dependent_policy(), Some(vec![target.clone()]));
        let mut host = RecordingHost::queued();
        wrapper.remove(&mut host, &target, false).unwrap();
        assert_eq!(host.ops.len(), 1);
        assert!(!host.ops[0].allow_cascade);
    }

    #[test]
    fn clear_cascades_every_captured_element() {
        let a = Value::Ref(ObjectId::new());
        let b = Value::Ref(ObjectId::new());
        let mut wrapper =
            SetWrapper::new(owner(), dependent_policy(), Some(vec![a.clone(), b.clone()]));
        let mut host = RecordingHost::immediate();

        wrapper.clear(&mut host).unwrap();
        assert!(wrapper.is_empty());
        assert_eq!(host.deletes, vec![a.clone(), b.clone()]);
        assert_eq!(host.relation_removes, vec![a, b]);
        assert_eq!(host.dirty_calls.len(), 1);
    }

    #[test]
    fn nontransactional_hook_fires_outside_transaction() {
        let mut wrapper = set_of(&[]);
        let mut host = RecordingHost::immediate();
        host.transaction_active = false;
        wrapper.add(&mut host, text("a")).unwrap();
        assert_eq!(host.nontransactional, 1);
    }

    // ========================================================================
    // Lists
    // ========================================================================

    #[test]
    fn list_positional_operations() {
        let mut list = ListWrapper::new(
            owner(),
            ContainerPolicy::default(),
            Some(vec![text("a"), text("c")]),
        );
        let mut host = RecordingHost::queued();

        list.insert(&mut host, 1, text("b")).unwrap();
        assert_eq!(list.values(), vec![text("a"), text("b"), text("c")]);

        let previous = list.set(&mut host, 0, text("z"), false).unwrap();
        assert_eq!(previous, text("a"));

        let removed = list.remove_at(&mut host, 2).unwrap();
        assert_eq!(removed, text("c"));
        assert_eq!(list.values(), vec![text("z"), text("b")]);

        let names: Vec<_> = host.ops.iter().map(|op| op.op_type_name()).collect();
        assert_eq!(
            names,
            vec!["ListInsert", "ListRemoveAt", "ListInsert", "ListRemoveAt"]
        );
    }

    #[test]
    fn list_index_checked_before_mutation() {
        let mut list = ListWrapper::new(owner(), ContainerPolicy::default(), Some(vec![text("a")]));
        let mut host = RecordingHost::queued();
        assert!(matches!(
            list.insert(&mut host, 5, text("x")),
            Err(EngineError::IndexOutOfBounds { index: 5, len: 1 })
        ));
        assert!(matches!(
            list.remove_at(&mut host, 1),
            Err(EngineError::IndexOutOfBounds { .. })
        ));
        assert_eq!(list.values(), vec![text("a")]);
        assert!(host.ops.is_empty());
        assert!(host.dirty_calls.is_empty());
    }

    #[test]
    fn ordered_list_keeps_value_order() {
        let mut list = OrderedListWrapper::new(
            owner(),
            ContainerPolicy::default(),
            Some(vec![Value::Integer(5), Value::Integer(1)]),
        );
        let mut host = RecordingHost::immediate();
        list.add(&mut host, Value::Integer(3)).unwrap();
        list.add(&mut host, Value::Integer(3)).unwrap();
        assert!(list.remove(&mut host, &Value::Integer(5), true).unwrap());
        assert_eq!(
            list.values(),
            vec![Value::Integer(1), Value::Integer(3), Value::Integer(3)]
        );
    }

    // ========================================================================
    // Detach / attach
    // ========================================================================

    #[test]
    fn attach_unchanged_copy_is_silent() {
        let mut wrapper = set_of(&["a", "b"]);
        let detached = wrapper.detach_copy();
        let mut host = RecordingHost::queued();
        let changed = wrapper
            .attach_copy(&mut host, detached.as_collection().unwrap())
            .unwrap();
        assert!(!changed);
        assert!(host.ops.is_empty());
        assert!(host.dirty_calls.is_empty());
    }

    #[test]
    fn attach_reconciles_without_cascade() {
        let a = Value::Ref(ObjectId::new());
        let b = Value::Ref(ObjectId::new());
        let mut wrapper = SetWrapper::new(owner(), dependent_policy(), Some(vec![a.clone()]));
        let mut host = RecordingHost::queued();

        assert!(wrapper.attach_copy(&mut host, &[b.clone()]).unwrap());
        assert_eq!(wrapper.values(), vec![b]);
        assert!(host.deletes.is_empty());
        assert_eq!(host.ops.len(), 2);
        assert!(!host.ops[0].allow_cascade);
    }
}
