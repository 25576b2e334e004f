use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{FieldOwner, ObjectId, OpId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    ElementAdd,
    ElementRemove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPayload {
    Element(Value),
    /// Positional list change.
    Indexed { index: usize, element: Value },
    /// Map put.
    Entry { key: Value, value: Value },
    /// Map removal by key.
    Key(Value),
}

impl OperationPayload {
    /// References carried by the payload, in payload order.
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            Self::Element(v) | Self::Indexed { element: v, .. } | Self::Key(v) => {
                v.as_ref_id().into_iter().collect()
            }
            Self::Entry { key, value } => [key.as_ref_id(), value.as_ref_id()]
                .into_iter()
                .flatten()
                .collect(),
        }
    }
}

/// One pending structural change to a second-class field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OpId,
    pub kind: OperationKind,
    pub owner: ObjectId,
    pub field: usize,
    pub payload: OperationPayload,
    pub allow_cascade: bool,
}

impl Operation {
    pub fn add(owner: FieldOwner, payload: OperationPayload) -> Self {
        Self {
            op_id: OpId::new(),
            kind: OperationKind::ElementAdd,
            owner: owner.object,
            field: owner.field,
            payload,
            allow_cascade: false,
        }
    }

    pub fn remove(owner: FieldOwner, payload: OperationPayload, allow_cascade: bool) -> Self {
        Self {
            op_id: OpId::new(),
            kind: OperationKind::ElementRemove,
            owner: owner.object,
            field: owner.field,
            payload,
            allow_cascade,
        }
    }

    pub fn field_owner(&self) -> FieldOwner {
        FieldOwner::new(self.owner, self.field)
    }

    /// String name of the operation for logging.
    pub fn op_type_name(&self) -> &'static str {
        match (self.kind, &self.payload) {
            (OperationKind::ElementAdd, OperationPayload::Entry { .. }) => "MapPut",
            (OperationKind::ElementAdd, OperationPayload::Indexed { .. }) => "ListInsert",
            (OperationKind::ElementAdd, _) => "CollectionAdd",
            (OperationKind::ElementRemove, OperationPayload::Key(_)) => "MapRemove",
            (OperationKind::ElementRemove, OperationPayload::Indexed { .. }) => "ListRemoveAt",
            (OperationKind::ElementRemove, _) => "CollectionRemove",
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind_and_cascade() {
        let owner = FieldOwner::new(ObjectId::new(), 2);
        let add = Operation::add(owner, OperationPayload::Element(Value::Integer(1)));
        assert_eq!(add.kind, OperationKind::ElementAdd);
        assert!(!add.allow_cascade);
        assert_eq!(add.op_type_name(), "CollectionAdd");

        let rm = Operation::remove(owner, OperationPayload::Key(Value::Text("k".into())), true);
        assert_eq!(rm.kind, OperationKind::ElementRemove);
        assert!(rm.allow_cascade);
        assert_eq!(rm.field_owner(), owner);
        assert_eq!(rm.op_type_name(), "MapRemove");
    }

    #[test]
    fn entry_references() {
        let k = ObjectId::new();
        let payload = OperationPayload::Entry {
            key: Value::Ref(k),
            value: Value::Null,
        };
        assert_eq!(payload.references(), vec![k]);
    }
}
