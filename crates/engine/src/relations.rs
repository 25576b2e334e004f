use objstate_core::{FieldOwner, ObjectId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationChangeKind {
    Added,
    Removed,
}

/// One side of a bidirectional relation changed; the other side follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationChange {
    pub owner: FieldOwner,
    pub target: ObjectId,
    pub kind: RelationChangeKind,
}

/// Collects relation changes made through wrappers until the context
/// reconciles the inverse fields.
#[derive(Debug, Default)]
pub struct RelationshipManager {
    changes: Vec<RelationChange>,
}

impl RelationshipManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation_add(&mut self, owner: FieldOwner, element: &Value) {
        self.record(owner, element, RelationChangeKind::Added);
    }

    pub fn relation_remove(&mut self, owner: FieldOwner, element: &Value) {
        self.record(owner, element, RelationChangeKind::Removed);
    }

    fn record(&mut self, owner: FieldOwner, element: &Value, kind: RelationChangeKind) {
        if let Some(target) = element.as_ref_id() {
            self.changes.push(RelationChange {
                owner,
                target,
                kind,
            });
        }
    }

    pub fn take(&mut self) -> Vec<RelationChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }
}
