use std::collections::VecDeque;

use objstate_core::{FieldOwner, ObjectId, operations::Operation};

/// Pending container changes, applied in arrival order at flush.
#[derive(Debug, Default)]
pub struct OperationQueue {
    ops: VecDeque<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push_back(op);
    }

    pub fn front(&self) -> Option<&Operation> {
        self.ops.front()
    }

    pub fn pop_front(&mut self) -> Option<Operation> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn has_ops_for(&self, owner: FieldOwner) -> bool {
        self.ops.iter().any(|op| op.field_owner() == owner)
    }

    /// Drop queued changes to one field, e.g. when the field is replaced wholesale.
    pub fn discard_field(&mut self, owner: FieldOwner) -> usize {
        let before = self.ops.len();
        self.ops.retain(|op| op.field_owner() != owner);
        before - self.ops.len()
    }

    pub fn discard_object(&mut self, object: ObjectId) -> usize {
        let before = self.ops.len();
        self.ops.retain(|op| op.owner != object);
        before - self.ops.len()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::{Value, operations::OperationPayload};

    #[test]
    fn fifo_and_discard() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let mut queue = OperationQueue::new();
        queue.push(Operation::add(
            FieldOwner::new(a, 0),
            OperationPayload::Element(Value::Integer(1)),
        ));
        queue.push(Operation::add(
            FieldOwner::new(b, 0),
            OperationPayload::Element(Value::Integer(2)),
        ));
        queue.push(Operation::add(
            FieldOwner::new(a, 1),
            OperationPayload::Element(Value::Integer(3)),
        ));

        assert!(queue.has_ops_for(FieldOwner::new(a, 1)));
        assert_eq!(queue.discard_field(FieldOwner::new(a, 1)), 1);
        assert_eq!(queue.front().map(|op| op.owner), Some(a));

        assert_eq!(queue.discard_object(a), 1);
        assert_eq!(queue.pop_front().map(|op| op.owner), Some(b));
        assert!(queue.is_empty());
    }
}
