use objstate_core::{
    ids::ObjectId,
    metadata::ClassMeta,
    operations::Operation,
    value::{FieldData, Value},
};

use crate::error::StorageError;
use crate::generation::SequenceSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub object_id: ObjectId,
    pub class_name: String,
    pub version: Option<i64>,
}

/// Field values handed to the backend for an insert or update.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub object_id: ObjectId,
    pub class_name: String,
    pub version: Option<i64>,
    pub fields: Vec<(usize, FieldData)>,
}

/// Map contents fetched in separate passes.
///
/// `keys` and `values` are only fetched when the keys (values) have their own
/// identity; `entries` associates them.
#[derive(Debug, Clone, Default)]
pub struct MapFetch {
    pub keys: Option<Vec<Value>>,
    pub values: Option<Vec<Value>>,
    pub entries: Vec<(Value, Value)>,
}

/// Backend persistence handler driven by the object-state core.
pub trait PersistenceHandler {
    fn begin(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn exists(&mut self, object_id: ObjectId) -> Result<Option<ObjectHeader>, StorageError>;

    fn load(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        fields: &[usize],
    ) -> Result<Vec<(usize, FieldData)>, StorageError>;

    fn load_map(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        field: usize,
    ) -> Result<MapFetch, StorageError> {
        let mut loaded = self.load(object_id, class, &[field])?;
        match loaded.pop() {
            Some((_, FieldData::Map(entries))) => Ok(MapFetch {
                keys: None,
                values: None,
                entries,
            }),
            Some(_) => Err(StorageError::Serialization(format!(
                "field {field} of {} is not a map",
                class.name
            ))),
            None => Ok(MapFetch::default()),
        }
    }

    fn insert(&mut self, record: &ObjectRecord) -> Result<(), StorageError>;

    /// `record.fields` holds only the dirty fields; `record.version` is the new version.
    fn update(
        &mut self,
        record: &ObjectRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError>;

    fn delete(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        version: Option<i64>,
    ) -> Result<(), StorageError>;

    /// Apply one queued structural change to a container field.
    fn apply(&mut self, op: &Operation, class: &ClassMeta) -> Result<(), StorageError>;

    /// Datastore-backed value generators allocate through this.
    fn sequence_source(&mut self) -> Option<&mut dyn SequenceSource> {
        None
    }
}
