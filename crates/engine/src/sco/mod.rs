//! Second-class object wrappers.
//!
//! A wrapper owns the real container (its delegate) and turns every
//! mutation into change tracking on the owning object: dirty bits, queued
//! operations, relationship records and dependent deletes. The owning side
//! is reached through [`ScoHost`], never through a pointer, so a wrapper can
//! outlive its binding and simply reject mutation once unbound.

mod collection;
mod map;
mod registry;
mod scalar;

pub use collection::{
    CollectionDelegate, CollectionWrapper, ListWrapper, OrderedListWrapper, SetWrapper,
    SortedSetWrapper, SortedVec,
};
pub use map::{HashMapWrapper, MapDelegate, MapWrapper, SortedMapWrapper};
pub use registry::{WrapperFactory, WrapperRegistry};
pub use scalar::ScalarWrapper;

use objstate_core::{ContainerShape, FieldData, FieldOwner, ObjectId, Value, operations::Operation};

use crate::error::EngineError;

/// The unit-of-work side of a wrapper mutation.
pub trait ScoHost {
    /// Set the dirty bit for the owner field. No-op for an owner that is no
    /// longer managed.
    fn make_dirty(&mut self, owner: FieldOwner);

    /// Whether changes to this owner are deferred as queued operations.
    fn queue_active(&self, owner: FieldOwner) -> bool;

    fn enqueue(&mut self, op: Operation);

    fn manage_relations(&self) -> bool;

    fn relation_add(&mut self, owner: FieldOwner, element: &Value);

    fn relation_remove(&mut self, owner: FieldOwner, element: &Value);

    /// Delete an element that was owned by the container.
    fn delete_dependent(&mut self, element: &Value);

    fn transaction_active(&self) -> bool;

    /// A change was made outside a transaction.
    fn nontransactional_update(&mut self, owner: FieldOwner);
}

pub(crate) fn bound(owner: Option<FieldOwner>) -> Result<FieldOwner, EngineError> {
    owner.ok_or(EngineError::Unbound)
}

pub(crate) fn check_nullable(allow_nulls: bool, element: &Value) -> Result<(), EngineError> {
    if element.is_null() && !allow_nulls {
        return Err(EngineError::InvalidElement(
            "null elements are not allowed in this container".to_string(),
        ));
    }
    Ok(())
}

/// Mark the owner dirty and run the non-transactional hook.
pub(crate) fn changed(host: &mut dyn ScoHost, owner: FieldOwner) {
    host.make_dirty(owner);
    if !host.transaction_active() {
        host.nontransactional_update(owner);
    }
}

fn mismatch(expected: &'static str, found: ContainerShape) -> EngineError {
    EngineError::ShapeMismatch {
        expected,
        found: found.as_str(),
    }
}

#[derive(Debug)]
pub enum Sco {
    Set(SetWrapper),
    SortedSet(SortedSetWrapper),
    List(ListWrapper),
    OrderedList(OrderedListWrapper),
    Map(HashMapWrapper),
    SortedMap(SortedMapWrapper),
    Scalar(ScalarWrapper),
}

macro_rules! collection_op {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            Sco::Set($w) => $body,
            Sco::SortedSet($w) => $body,
            Sco::List($w) => $body,
            Sco::OrderedList($w) => $body,
            other => Err(mismatch("collection", other.shape())),
        }
    };
}

macro_rules! map_op {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            Sco::Map($w) => $body,
            Sco::SortedMap($w) => $body,
            other => Err(mismatch("map", other.shape())),
        }
    };
}

impl Sco {
    pub fn shape(&self) -> ContainerShape {
        match self {
            Sco::Set(_) => ContainerShape::Set,
            Sco::SortedSet(_) => ContainerShape::SortedSet,
            Sco::List(_) => ContainerShape::List,
            Sco::OrderedList(_) => ContainerShape::OrderedList,
            Sco::Map(_) => ContainerShape::Map,
            Sco::SortedMap(_) => ContainerShape::SortedMap,
            Sco::Scalar(_) => ContainerShape::ScalarMutable,
        }
    }

    pub fn owner(&self) -> Option<FieldOwner> {
        match self {
            Sco::Set(w) => w.owner(),
            Sco::SortedSet(w) => w.owner(),
            Sco::List(w) => w.owner(),
            Sco::OrderedList(w) => w.owner(),
            Sco::Map(w) => w.owner(),
            Sco::SortedMap(w) => w.owner(),
            Sco::Scalar(w) => w.owner(),
        }
    }

    pub fn unset_owner(&mut self) {
        match self {
            Sco::Set(w) => w.unset_owner(),
            Sco::SortedSet(w) => w.unset_owner(),
            Sco::List(w) => w.unset_owner(),
            Sco::OrderedList(w) => w.unset_owner(),
            Sco::Map(w) => w.unset_owner(),
            Sco::SortedMap(w) => w.unset_owner(),
            Sco::Scalar(w) => w.unset_owner(),
        }
    }

    /// Plain copy of the wrapped value, detached from any owner.
    pub fn detach_copy(&self) -> FieldData {
        match self {
            Sco::Set(w) => w.detach_copy(),
            Sco::SortedSet(w) => w.detach_copy(),
            Sco::List(w) => w.detach_copy(),
            Sco::OrderedList(w) => w.detach_copy(),
            Sco::Map(w) => w.detach_copy(),
            Sco::SortedMap(w) => w.detach_copy(),
            Sco::Scalar(w) => w.detach_copy(),
        }
    }

    /// Reconcile against detached data. Returns whether anything changed.
    pub fn attach_copy(
        &mut self,
        host: &mut dyn ScoHost,
        detached: &FieldData,
    ) -> Result<bool, EngineError> {
        match (self, detached) {
            (Sco::Scalar(w), FieldData::Scalar(value)) => w.attach_copy(host, value),
            (Sco::Map(w), FieldData::Map(entries)) => w.attach_copy(host, entries),
            (Sco::SortedMap(w), FieldData::Map(entries)) => w.attach_copy(host, entries),
            (Sco::Set(w), FieldData::Collection(items)) => w.attach_copy(host, items),
            (Sco::SortedSet(w), FieldData::Collection(items)) => w.attach_copy(host, items),
            (Sco::List(w), FieldData::Collection(items)) => w.attach_copy(host, items),
            (Sco::OrderedList(w), FieldData::Collection(items)) => w.attach_copy(host, items),
            (sco, _) => Err(EngineError::ShapeMismatch {
                expected: sco.shape().as_str(),
                found: "detached data of another shape",
            }),
        }
    }

    pub fn references(&self) -> Vec<ObjectId> {
        self.detach_copy().references()
    }

    pub fn len(&self) -> usize {
        match self {
            Sco::Set(w) => w.len(),
            Sco::SortedSet(w) => w.len(),
            Sco::List(w) => w.len(),
            Sco::OrderedList(w) => w.len(),
            Sco::Map(w) => w.len(),
            Sco::SortedMap(w) => w.len(),
            Sco::Scalar(w) => usize::from(!w.get().is_null()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, element: &Value) -> bool {
        match self {
            Sco::Set(w) => w.contains(element),
            Sco::SortedSet(w) => w.contains(element),
            Sco::List(w) => w.contains(element),
            Sco::OrderedList(w) => w.contains(element),
            Sco::Map(w) => w.contains_key(element),
            Sco::SortedMap(w) => w.contains_key(element),
            Sco::Scalar(w) => w.get() == element,
        }
    }

    pub fn add(&mut self, host: &mut dyn ScoHost, element: Value) -> Result<bool, EngineError> {
        collection_op!(self, w => w.add(host, element))
    }

    pub fn add_all(
        &mut self,
        host: &mut dyn ScoHost,
        elements: Vec<Value>,
    ) -> Result<bool, EngineError> {
        collection_op!(self, w => w.add_all(host, elements))
    }

    pub fn remove(
        &mut self,
        host: &mut dyn ScoHost,
        element: &Value,
        allow_cascade: bool,
    ) -> Result<bool, EngineError> {
        collection_op!(self, w => w.remove(host, element, allow_cascade))
    }

    pub fn remove_all(
        &mut self,
        host: &mut dyn ScoHost,
        elements: &[Value],
    ) -> Result<bool, EngineError> {
        collection_op!(self, w => w.remove_all(host, elements))
    }

    pub fn retain_all(
        &mut self,
        host: &mut dyn ScoHost,
        keep: &[Value],
    ) -> Result<bool, EngineError> {
        collection_op!(self, w => w.retain_all(host, keep))
    }

    /// Empties a collection or map.
    pub fn clear(&mut self, host: &mut dyn ScoHost) -> Result<(), EngineError> {
        match self {
            Sco::Map(w) => w.clear(host),
            Sco::SortedMap(w) => w.clear(host),
            other => collection_op!(other, w => w.clear(host)),
        }
    }

    pub fn as_list_mut(&mut self) -> Result<&mut ListWrapper, EngineError> {
        match self {
            Sco::List(w) => Ok(w),
            other => Err(mismatch("list", other.shape())),
        }
    }

    pub fn put(
        &mut self,
        host: &mut dyn ScoHost,
        key: Value,
        value: Value,
    ) -> Result<Option<Value>, EngineError> {
        map_op!(self, w => w.put(host, key, value))
    }

    pub fn remove_key(
        &mut self,
        host: &mut dyn ScoHost,
        key: &Value,
    ) -> Result<Option<Value>, EngineError> {
        map_op!(self, w => w.remove(host, key))
    }

    pub fn set_scalar(
        &mut self,
        host: &mut dyn ScoHost,
        value: Value,
    ) -> Result<Value, EngineError> {
        match self {
            Sco::Scalar(w) => w.set(host, value),
            other => Err(mismatch("scalar-mutable", other.shape())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Host that records every callback instead of touching a context.
    #[derive(Debug)]
    pub struct RecordingHost {
        pub queued: bool,
        pub manage_relations: bool,
        pub transaction_active: bool,
        pub dirty_calls: Vec<FieldOwner>,
        pub ops: Vec<Operation>,
        pub relation_adds: Vec<Value>,
        pub relation_removes: Vec<Value>,
        pub deletes: Vec<Value>,
        pub nontransactional: usize,
    }

    impl RecordingHost {
        pub fn immediate() -> Self {
            Self {
                queued: false,
                manage_relations: true,
                transaction_active: true,
                dirty_calls: Vec::new(),
                ops: Vec::new(),
                relation_adds: Vec::new(),
                relation_removes: Vec::new(),
                deletes: Vec::new(),
                nontransactional: 0,
            }
        }

        pub fn queued() -> Self {
            Self {
                queued: true,
                ..Self::immediate()
            }
        }
    }

    impl ScoHost for RecordingHost {
        fn make_dirty(&mut self, owner: FieldOwner) {
            self.dirty_calls.push(owner);
        }

        fn queue_active(&self, _owner: FieldOwner) -> bool {
            self.queued
        }

        fn enqueue(&mut self, op: Operation) {
            self.ops.push(op);
        }

        fn manage_relations(&self) -> bool {
            self.manage_relations
        }

        fn relation_add(&mut self, _owner: FieldOwner, element: &Value) {
            self.relation_adds.push(element.clone());
        }

        fn relation_remove(&mut self, _owner: FieldOwner, element: &Value) {
            self.relation_removes.push(element.clone());
        }

        fn delete_dependent(&mut self, element: &Value) {
            self.deletes.push(element.clone());
        }

        fn transaction_active(&self) -> bool {
            self.transaction_active
        }

        fn nontransactional_update(&mut self, _owner: FieldOwner) {
            self.nontransactional += 1;
        }
    }
}
