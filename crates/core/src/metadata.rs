use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;
use crate::value::ValueType;

/// Container shape of a second-class field. Selects the wrapper type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerShape {
    Set,
    List,
    Map,
    OrderedList,
    SortedSet,
    SortedMap,
    ScalarMutable,
}

impl ContainerShape {
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map | Self::SortedMap)
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Self::Set | Self::List | Self::OrderedList | Self::SortedSet
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::List => "list",
            Self::Map => "map",
            Self::OrderedList => "ordered-list",
            Self::SortedSet => "sorted-set",
            Self::SortedMap => "sorted-map",
            Self::ScalarMutable => "scalar-mutable",
        }
    }
}

/// How a field's value is generated when it is still null at insert time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueStrategy {
    Increment,
    Uuid,
    Sequence(String),
}

impl ValueStrategy {
    pub fn name(&self) -> &str {
        match self {
            Self::Increment => "increment",
            Self::Uuid => "uuid",
            Self::Sequence(name) => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub number: usize,
    pub name: String,
    pub value_type: ValueType,
    pub container: Option<ContainerShape>,
    /// Target class of a relationship field; `None` for value fields.
    pub relation: Option<String>,
    pub cascade_persist: bool,
    /// Single-valued reference whose target is deleted with the owner.
    pub dependent: bool,
    pub dependent_elements: bool,
    pub dependent_keys: bool,
    pub dependent_values: bool,
    pub elements_have_identity: bool,
    pub keys_have_identity: bool,
    pub values_have_identity: bool,
    pub allow_nulls: bool,
    /// Field number of the inverse side on the related class.
    pub mapped_by: Option<usize>,
    pub value_strategy: Option<ValueStrategy>,
}

impl FieldMeta {
    fn base(name: &str, value_type: ValueType) -> Self {
        Self {
            number: 0,
            name: name.to_string(),
            value_type,
            container: None,
            relation: None,
            cascade_persist: false,
            dependent: false,
            dependent_elements: false,
            dependent_keys: false,
            dependent_values: false,
            elements_have_identity: false,
            keys_have_identity: false,
            values_have_identity: false,
            allow_nulls: true,
            mapped_by: None,
            value_strategy: None,
        }
    }

    pub fn scalar(name: &str, value_type: ValueType) -> Self {
        Self::base(name, value_type)
    }

    /// Single-valued reference to another persistable class.
    pub fn reference(name: &str, target: &str) -> Self {
        let mut meta = Self::base(name, ValueType::Ref);
        meta.relation = Some(target.to_string());
        meta
    }

    pub fn collection(name: &str, shape: ContainerShape, element_type: ValueType) -> Self {
        let mut meta = Self::base(name, element_type);
        meta.container = Some(shape);
        meta
    }

    /// Collection whose elements are references to `target`.
    pub fn collection_of(name: &str, shape: ContainerShape, target: &str) -> Self {
        let mut meta = Self::collection(name, shape, ValueType::Ref);
        meta.relation = Some(target.to_string());
        meta.elements_have_identity = true;
        meta
    }

    pub fn map(name: &str, shape: ContainerShape) -> Self {
        let mut meta = Self::base(name, ValueType::Any);
        meta.container = Some(shape);
        meta
    }

    pub fn mutable_scalar(name: &str, value_type: ValueType) -> Self {
        let mut meta = Self::base(name, value_type);
        meta.container = Some(ContainerShape::ScalarMutable);
        meta
    }

    pub fn with_ref_keys(mut self, target: &str) -> Self {
        self.relation = Some(target.to_string());
        self.keys_have_identity = true;
        self
    }

    pub fn with_ref_values(mut self, target: &str) -> Self {
        self.relation = Some(target.to_string());
        self.values_have_identity = true;
        self
    }

    pub fn cascade_persist(mut self) -> Self {
        self.cascade_persist = true;
        self
    }

    /// Marks the referenced object(s) as owned by this field.
    pub fn dependent(mut self) -> Self {
        match self.container {
            Some(shape) if shape.is_map() => {
                self.dependent_keys = self.keys_have_identity;
                self.dependent_values = self.values_have_identity;
            }
            Some(shape) if shape.is_collection() => self.dependent_elements = true,
            _ => self.dependent = true,
        }
        self
    }

    pub fn mapped_by(mut self, inverse_field: usize) -> Self {
        self.mapped_by = Some(inverse_field);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allow_nulls = false;
        self
    }

    pub fn generated(mut self, strategy: ValueStrategy) -> Self {
        self.value_strategy = Some(strategy);
        self
    }

    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    pub fn is_sco(&self) -> bool {
        self.container.is_some()
    }

    pub fn is_map(&self) -> bool {
        self.container.is_some_and(|s| s.is_map())
    }

    pub fn is_collection(&self) -> bool {
        self.container.is_some_and(|s| s.is_collection())
    }

    pub fn container_policy(&self) -> ContainerPolicy {
        ContainerPolicy {
            allow_nulls: self.allow_nulls,
            // Dependency only applies to elements that have their own identity.
            dependent_elements: self.dependent_elements && self.elements_have_identity,
            dependent_keys: self.dependent_keys && self.keys_have_identity,
            dependent_values: self.dependent_values && self.values_have_identity,
            elements_have_identity: self.elements_have_identity,
            keys_have_identity: self.keys_have_identity,
            values_have_identity: self.values_have_identity,
        }
    }
}

/// The slice of field metadata a wrapper consults while mutating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerPolicy {
    pub allow_nulls: bool,
    pub dependent_elements: bool,
    pub dependent_keys: bool,
    pub dependent_values: bool,
    pub elements_have_identity: bool,
    pub keys_have_identity: bool,
    pub values_have_identity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMeta {
    pub name: String,
    pub versioned: bool,
    fields: Vec<FieldMeta>,
}

impl ClassMeta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versioned: false,
            fields: Vec::new(),
        }
    }

    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    /// Appends a field; its absolute number is its position.
    pub fn field(mut self, mut meta: FieldMeta) -> Self {
        meta.number = self.fields.len();
        self.fields.push(meta);
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn member(&self, number: usize) -> Result<&FieldMeta, CoreError> {
        self.fields.get(number).ok_or_else(|| CoreError::UnknownField {
            class: self.name.clone(),
            field: number,
        })
    }

    pub fn field_number(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn relation_field_numbers(&self) -> Vec<usize> {
        self.fields
            .iter()
            .filter(|f| f.is_relation())
            .map(|f| f.number)
            .collect()
    }
}

pub trait MetadataProvider: Send + Sync {
    fn class(&self, name: &str) -> Option<Arc<ClassMeta>>;
}

#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: HashMap<String, Arc<ClassMeta>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassMeta) -> Arc<ClassMeta> {
        let class = Arc::new(class);
        self.classes.insert(class.name.clone(), Arc::clone(&class));
        class
    }

    pub fn with_class(mut self, class: ClassMeta) -> Self {
        self.register(class);
        self
    }
}

impl MetadataProvider for MetadataRegistry {
    fn class(&self, name: &str) -> Option<Arc<ClassMeta>> {
        self.classes.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> ClassMeta {
        ClassMeta::new("Library")
            .field(FieldMeta::scalar("name", ValueType::Text))
            .field(
                FieldMeta::collection_of("books", ContainerShape::Set, "Book")
                    .cascade_persist()
                    .dependent(),
            )
            .field(FieldMeta::collection("tags", ContainerShape::Set, ValueType::Text).dependent())
            .field(
                FieldMeta::map("shelves", ContainerShape::Map)
                    .with_ref_values("Book")
                    .dependent(),
            )
    }

    #[test]
    fn field_numbers_follow_declaration_order() {
        let class = library();
        assert_eq!(class.field_number("tags"), Some(2));
        assert_eq!(class.member(1).unwrap().name, "books");
        assert!(class.member(9).is_err());
        assert_eq!(class.relation_field_numbers(), vec![1, 3]);
    }

    #[test]
    fn dependency_requires_identity() {
        let class = library();
        assert!(class.member(1).unwrap().container_policy().dependent_elements);
        assert!(!class.member(2).unwrap().container_policy().dependent_elements);

        let shelves = class.member(3).unwrap().container_policy();
        assert!(shelves.dependent_values);
        assert!(!shelves.dependent_keys);
    }

    #[test]
    fn registry_lookup() {
        let registry = MetadataRegistry::new().with_class(library());
        assert!(registry.class("Library").is_some());
        assert!(registry.class("Missing").is_none());
    }
}
