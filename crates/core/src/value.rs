use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::ids::ObjectId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    Ref(ObjectId),
    Bytes(Vec<u8>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Text(s) => s.hash(state),
            Self::Integer(n) | Self::Timestamp(n) => n.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Boolean(b) => b.hash(state),
            Self::Ref(id) => id.hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Ref(a), Self::Ref(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) => 2,
            Self::Float(_) => 3,
            Self::Timestamp(_) => 4,
            Self::Text(_) => 5,
            Self::Bytes(_) => 6,
            Self::Ref(_) => 7,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Only references carry an independent identity.
    pub fn is_persistable(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Coerce to the declared type of a field. `None` when no lossless
    /// conversion exists.
    pub fn convert_to(&self, target: ValueType) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (_, ValueType::Any) => Some(self.clone()),
            (Value::Integer(n), ValueType::Integer) => Some(Value::Integer(*n)),
            (Value::Integer(n), ValueType::Text) => Some(Value::Text(n.to_string())),
            (Value::Integer(n), ValueType::Float) => Some(Value::Float(*n as f64)),
            (Value::Integer(n), ValueType::Timestamp) => Some(Value::Timestamp(*n)),
            (Value::Text(s), ValueType::Text) => Some(Value::Text(s.clone())),
            (Value::Text(s), ValueType::Integer) => s.parse().ok().map(Value::Integer),
            (Value::Text(s), ValueType::Float) => s.parse().ok().map(Value::Float),
            (Value::Float(f), ValueType::Float) => Some(Value::Float(*f)),
            (Value::Boolean(b), ValueType::Boolean) => Some(Value::Boolean(*b)),
            (Value::Timestamp(t), ValueType::Timestamp) => Some(Value::Timestamp(*t)),
            (Value::Timestamp(t), ValueType::Integer) => Some(Value::Integer(*t)),
            (Value::Ref(id), ValueType::Ref) => Some(Value::Ref(*id)),
            (Value::Bytes(b), ValueType::Bytes) => Some(Value::Bytes(b.clone())),
            _ => None,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Declared type of a scalar field, or of a container's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Any,
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Ref,
    Bytes,
}

/// Materialized content of one persistent field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldData {
    Scalar(Value),
    Collection(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl FieldData {
    pub fn null() -> Self {
        FieldData::Scalar(Value::Null)
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldData::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[Value]> {
        match self {
            FieldData::Collection(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            FieldData::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Every object reference held by this field, keys before values for maps.
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            FieldData::Scalar(v) => v.as_ref_id().into_iter().collect(),
            FieldData::Collection(items) => items.iter().filter_map(Value::as_ref_id).collect(),
            FieldData::Map(entries) => entries
                .iter()
                .flat_map(|(k, v)| [k.as_ref_id(), v.as_ref_id()])
                .flatten()
                .collect(),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    #[test]
    fn float_equality_is_total() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn mixed_values_sort_and_hash() {
        let id = ObjectId::new();
        let values = vec![
            Value::Ref(id),
            Value::Text("b".into()),
            Value::Integer(3),
            Value::Null,
            Value::Text("a".into()),
        ];
        let sorted: Vec<Value> = values
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(sorted[0], Value::Null);
        assert_eq!(sorted[1], Value::Integer(3));
        assert_eq!(sorted[2], Value::Text("a".into()));
        assert_eq!(sorted[4], Value::Ref(id));

        let set: HashSet<Value> = values.into_iter().collect();
        assert!(set.contains(&Value::Text("a".into())));
    }

    #[test]
    fn conversion_rules() {
        assert_eq!(
            Value::Integer(7).convert_to(ValueType::Text),
            Some(Value::Text("7".into()))
        );
        assert_eq!(
            Value::Text("42".into()).convert_to(ValueType::Integer),
            Some(Value::Integer(42))
        );
        assert_eq!(Value::Text("x".into()).convert_to(ValueType::Integer), None);
        assert_eq!(Value::Boolean(true).convert_to(ValueType::Ref), None);
    }

    #[test]
    fn references_cover_map_keys_and_values() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let data = FieldData::Map(vec![
            (Value::Ref(a), Value::Integer(1)),
            (Value::Text("k".into()), Value::Ref(b)),
        ]);
        assert_eq!(data.references(), vec![a, b]);
    }

    #[test]
    fn msgpack_preserves_field_data() {
        let data = FieldData::Collection(vec![Value::Text("x".into()), Value::Bytes(vec![1, 2])]);
        let bytes = data.to_msgpack().unwrap();
        assert_eq!(FieldData::from_msgpack(&bytes).unwrap(), data);
    }
}
