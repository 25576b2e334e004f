use std::collections::HashMap;

use objstate_core::{ContainerPolicy, ContainerShape, FieldData, FieldOwner, Value};

use super::{
    HashMapWrapper, ListWrapper, OrderedListWrapper, ScalarWrapper, Sco, SetWrapper,
    SortedMapWrapper, SortedSetWrapper,
};
use crate::error::EngineError;

pub type WrapperFactory =
    fn(FieldOwner, ContainerPolicy, Option<FieldData>) -> Result<Sco, EngineError>;

fn collection_items(data: Option<FieldData>) -> Result<Option<Vec<Value>>, EngineError> {
    match data {
        None => Ok(None),
        Some(FieldData::Collection(items)) => Ok(Some(items)),
        // A null collection field materializes as an empty container.
        Some(FieldData::Scalar(Value::Null)) => Ok(None),
        Some(_) => Err(EngineError::ShapeMismatch {
            expected: "collection",
            found: "non-collection data",
        }),
    }
}

fn map_entries(data: Option<FieldData>) -> Result<Option<Vec<(Value, Value)>>, EngineError> {
    match data {
        None => Ok(None),
        Some(FieldData::Map(entries)) => Ok(Some(entries)),
        Some(FieldData::Scalar(Value::Null)) => Ok(None),
        Some(_) => Err(EngineError::ShapeMismatch {
            expected: "map",
            found: "non-map data",
        }),
    }
}

fn wrap_set(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::Set(SetWrapper::new(owner, policy, collection_items(data)?)))
}

fn wrap_sorted_set(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::SortedSet(SortedSetWrapper::new(owner, policy, collection_items(data)?)))
}

fn wrap_list(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::List(ListWrapper::new(owner, policy, collection_items(data)?)))
}

fn wrap_ordered_list(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::OrderedList(OrderedListWrapper::new(owner, policy, collection_items(data)?)))
}

fn wrap_map(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::Map(HashMapWrapper::new(owner, policy, map_entries(data)?)))
}

fn wrap_sorted_map(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    Ok(Sco::SortedMap(SortedMapWrapper::new(owner, policy, map_entries(data)?)))
}

fn wrap_scalar(
    owner: FieldOwner,
    policy: ContainerPolicy,
    data: Option<FieldData>,
) -> Result<Sco, EngineError> {
    let value = match data {
        None => None,
        Some(FieldData::Scalar(value)) => Some(value),
        Some(_) => {
            return Err(EngineError::ShapeMismatch {
                expected: "scalar",
                found: "container data",
            });
        }
    };
    Ok(Sco::Scalar(ScalarWrapper::new(owner, policy, value)))
}

/// Maps each container shape to the factory that wraps it.
#[derive(Debug, Clone)]
pub struct WrapperRegistry {
    factories: HashMap<ContainerShape, WrapperFactory>,
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(ContainerShape::Set, wrap_set);
        registry.register(ContainerShape::SortedSet, wrap_sorted_set);
        registry.register(ContainerShape::List, wrap_list);
        registry.register(ContainerShape::OrderedList, wrap_ordered_list);
        registry.register(ContainerShape::Map, wrap_map);
        registry.register(ContainerShape::SortedMap, wrap_sorted_map);
        registry.register(ContainerShape::ScalarMutable, wrap_scalar);
        registry
    }
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the factory for one shape.
    pub fn register(&mut self, shape: ContainerShape, factory: WrapperFactory) {
        self.factories.insert(shape, factory);
    }

    pub fn wrap(
        &self,
        shape: ContainerShape,
        owner: FieldOwner,
        policy: ContainerPolicy,
        data: Option<FieldData>,
    ) -> Result<Sco, EngineError> {
        let factory = self.factories.get(&shape).ok_or(EngineError::ShapeMismatch {
            expected: "registered container shape",
            found: shape.as_str(),
        })?;
        factory(owner, policy, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::ObjectId;

    #[test]
    fn every_shape_has_a_factory() {
        let registry = WrapperRegistry::new();
        let owner = FieldOwner::new(ObjectId::new(), 0);
        for shape in [
            ContainerShape::Set,
            ContainerShape::SortedSet,
            ContainerShape::List,
            ContainerShape::OrderedList,
            ContainerShape::Map,
            ContainerShape::SortedMap,
            ContainerShape::ScalarMutable,
        ] {
            let sco = registry.wrap(shape, owner, ContainerPolicy::default(), None).unwrap();
            assert_eq!(sco.shape(), shape);
            assert!(sco.is_empty());
            assert_eq!(sco.owner(), Some(owner));
        }
    }

    #[test]
    fn wrong_data_is_rejected() {
        let registry = WrapperRegistry::new();
        let owner = FieldOwner::new(ObjectId::new(), 0);
        let result = registry.wrap(
            ContainerShape::Map,
            owner,
            ContainerPolicy::default(),
            Some(FieldData::Collection(vec![Value::Integer(1)])),
        );
        assert!(matches!(result, Err(EngineError::ShapeMismatch { .. })));
    }

    #[test]
    fn custom_factory_overrides_builtin() {
        fn always_sorted(
            owner: FieldOwner,
            policy: ContainerPolicy,
            data: Option<FieldData>,
        ) -> Result<Sco, EngineError> {
            Ok(Sco::SortedSet(SortedSetWrapper::new(owner, policy, collection_items(data)?)))
        }

        let mut registry = WrapperRegistry::new();
        registry.register(ContainerShape::Set, always_sorted);
        let sco = registry
            .wrap(
                ContainerShape::Set,
                FieldOwner::new(ObjectId::new(), 0),
                ContainerPolicy::default(),
                Some(FieldData::Collection(vec![Value::Integer(2), Value::Integer(1)])),
            )
            .unwrap();
        assert_eq!(
            sco.detach_copy(),
            FieldData::Collection(vec![Value::Integer(1), Value::Integer(2)])
        );
    }
}
