use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use objstate_core::{ClassMeta, FieldData, ObjectId, operations::Operation};
use objstate_storage::{
    MapFetch, ObjectHeader, ObjectRecord, PersistenceHandler, SequenceSource, SqliteStorage,
    StorageError,
};

/// Per-method call counts plus the writes that reached the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub exists: usize,
    pub loads: usize,
    pub map_loads: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub applies: usize,
    pub inserted: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    pub applied: Vec<Operation>,
}

impl CallCounts {
    /// Backend round trips that read object state.
    pub fn reads(&self) -> usize {
        self.loads + self.map_loads
    }

    pub fn writes(&self) -> usize {
        self.inserts + self.updates + self.deletes + self.applies
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_applies: usize,
    fail_updates: usize,
    truncate_map_keys: bool,
}

#[derive(Debug, Default)]
struct Shared {
    counts: Mutex<CallCounts>,
    faults: Mutex<Faults>,
}

/// Test-side handle onto a [`RecordingBackend`] that has been moved into a
/// context.
#[derive(Debug, Clone)]
pub struct BackendProbe {
    shared: Arc<Shared>,
}

impl BackendProbe {
    pub fn counts(&self) -> CallCounts {
        self.shared.counts.lock().clone()
    }

    pub fn reset(&self) {
        *self.shared.counts.lock() = CallCounts::default();
    }

    /// Fail the next `n` queued-operation applies.
    pub fn fail_next_applies(&self, n: usize) {
        self.shared.faults.lock().fail_applies = n;
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.shared.faults.lock().fail_updates = n;
    }

    /// Drop one key from every independently fetched key list.
    pub fn truncate_map_keys(&self, enabled: bool) {
        self.shared.faults.lock().truncate_map_keys = enabled;
    }
}

/// A `SqliteStorage` that counts calls and fails on request.
#[derive(Debug)]
pub struct RecordingBackend {
    inner: SqliteStorage,
    shared: Arc<Shared>,
}

impl RecordingBackend {
    pub fn new(inner: SqliteStorage) -> (Self, BackendProbe) {
        let shared = Arc::new(Shared::default());
        let probe = BackendProbe {
            shared: Arc::clone(&shared),
        };
        (Self { inner, shared }, probe)
    }

    pub fn in_memory() -> Result<(Self, BackendProbe), StorageError> {
        Ok(Self::new(SqliteStorage::open_in_memory()?))
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }
}

impl PersistenceHandler for RecordingBackend {
    fn begin(&mut self) -> Result<(), StorageError> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.inner.rollback()
    }

    fn exists(&mut self, object_id: ObjectId) -> Result<Option<ObjectHeader>, StorageError> {
        self.shared.counts.lock().exists += 1;
        self.inner.exists(object_id)
    }

    fn load(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        fields: &[usize],
    ) -> Result<Vec<(usize, FieldData)>, StorageError> {
        self.shared.counts.lock().loads += 1;
        self.inner.load(object_id, class, fields)
    }

    fn load_map(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        field: usize,
    ) -> Result<MapFetch, StorageError> {
        self.shared.counts.lock().map_loads += 1;
        let mut fetch = self.inner.load_map(object_id, class, field)?;
        if self.shared.faults.lock().truncate_map_keys {
            let mut keys = fetch
                .keys
                .take()
                .unwrap_or_else(|| fetch.entries.iter().map(|(k, _)| k.clone()).collect());
            keys.pop();
            debug!(object = %object_id, field, keys = keys.len(), "truncated map keys");
            fetch.keys = Some(keys);
        }
        Ok(fetch)
    }

    fn insert(&mut self, record: &ObjectRecord) -> Result<(), StorageError> {
        self.inner.insert(record)?;
        let mut counts = self.shared.counts.lock();
        counts.inserts += 1;
        counts.inserted.push(record.object_id);
        Ok(())
    }

    fn update(
        &mut self,
        record: &ObjectRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError> {
        if Self::take_fault(&mut self.shared.faults.lock().fail_updates) {
            debug!(object = %record.object_id, "injected update failure");
            return Err(StorageError::Injected(format!("update {}", record.object_id)));
        }
        self.inner.update(record, expected_version)?;
        self.shared.counts.lock().updates += 1;
        Ok(())
    }

    fn delete(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        version: Option<i64>,
    ) -> Result<(), StorageError> {
        self.inner.delete(object_id, class, version)?;
        let mut counts = self.shared.counts.lock();
        counts.deletes += 1;
        counts.deleted.push(object_id);
        Ok(())
    }

    fn apply(&mut self, op: &Operation, class: &ClassMeta) -> Result<(), StorageError> {
        if Self::take_fault(&mut self.shared.faults.lock().fail_applies) {
            debug!(op = op.op_type_name(), owner = %op.owner, "injected apply failure");
            return Err(StorageError::Injected(op.op_type_name().to_string()));
        }
        self.inner.apply(op, class)?;
        let mut counts = self.shared.counts.lock();
        counts.applies += 1;
        counts.applied.push(op.clone());
        Ok(())
    }

    fn sequence_source(&mut self) -> Option<&mut dyn SequenceSource> {
        Some(&mut self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstate_core::{FieldMeta, Value, ValueType};

    #[test]
    fn probe_sees_calls_made_through_the_backend() {
        let (mut backend, probe) = RecordingBackend::in_memory().unwrap();
        let class = ClassMeta::new("Note").field(FieldMeta::scalar("text", ValueType::Text));
        let id = ObjectId::new();
        backend
            .insert(&ObjectRecord {
                object_id: id,
                class_name: "Note".into(),
                version: None,
                fields: vec![(0, FieldData::Scalar(Value::Text("a".into())))],
            })
            .unwrap();
        backend.load(id, &class, &[0]).unwrap();

        let counts = probe.counts();
        assert_eq!(counts.inserted, vec![id]);
        assert_eq!(counts.reads(), 1);
        probe.reset();
        assert_eq!(probe.counts(), CallCounts::default());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let (mut backend, probe) = RecordingBackend::in_memory().unwrap();
        probe.fail_next_updates(1);
        let record = ObjectRecord {
            object_id: ObjectId::new(),
            class_name: "Note".into(),
            version: None,
            fields: Vec::new(),
        };
        assert!(matches!(
            backend.update(&record, None),
            Err(StorageError::Injected(_))
        ));
        // Second attempt reaches sqlite, which has no such object.
        assert!(!matches!(
            backend.update(&record, None),
            Err(StorageError::Injected(_))
        ));
    }
}
