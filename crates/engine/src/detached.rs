use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use objstate_core::{FieldData, ObjectId};

/// Copy of one object taken out of its execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedObject {
    pub id: ObjectId,
    pub class_name: String,
    pub version: Option<i64>,
    /// Loaded fields only.
    pub fields: Vec<(usize, FieldData)>,
}

impl DetachedObject {
    pub fn field(&self, number: usize) -> Option<&FieldData> {
        self.fields
            .iter()
            .find(|(field, _)| *field == number)
            .map(|(_, data)| data)
    }

    pub fn field_mut(&mut self, number: usize) -> Option<&mut FieldData> {
        self.fields
            .iter_mut()
            .find(|(field, _)| *field == number)
            .map(|(_, data)| data)
    }
}

/// A detached object together with every loaded object it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedGraph {
    pub root: ObjectId,
    pub objects: IndexMap<ObjectId, DetachedObject>,
}

impl DetachedGraph {
    pub fn new(root: ObjectId) -> Self {
        Self {
            root,
            objects: IndexMap::new(),
        }
    }

    pub fn root_object(&self) -> Option<&DetachedObject> {
        self.objects.get(&self.root)
    }

    pub fn get(&self, id: ObjectId) -> Option<&DetachedObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut DetachedObject> {
        self.objects.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::Value;

    #[test]
    fn graph_survives_msgpack() {
        let id = ObjectId::new();
        let mut graph = DetachedGraph::new(id);
        graph.objects.insert(
            id,
            DetachedObject {
                id,
                class_name: "Note".into(),
                version: Some(3),
                fields: vec![(0, FieldData::Scalar(Value::Text("hi".into())))],
            },
        );

        let bytes = rmp_serde::to_vec(&graph).unwrap();
        let back: DetachedGraph = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, graph);
        assert_eq!(
            back.root_object().and_then(|o| o.field(0)),
            Some(&FieldData::Scalar(Value::Text("hi".into())))
        );
    }
}
