use std::sync::Arc;

use tempfile::TempDir;

use objstate_core::{FieldData, ObjectId, Value};
use objstate_engine::{ContextConfig, ExecutionContext, PersistenceRuntime};
use objstate_storage::{SqliteStorage, StorageError};

use crate::backend::{BackendProbe, RecordingBackend};
use crate::model;

/// A runtime over the sample model and one sqlite file that every context
/// opened from it shares.
pub struct TestSession {
    runtime: Arc<PersistenceRuntime>,
    path: String,
    _dir: TempDir,
}

impl TestSession {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir
            .path()
            .join("objstate.db")
            .to_str()
            .ok_or("temp path is not valid utf-8")?
            .to_string();
        let runtime = PersistenceRuntime::new(model::registry())
            .with_config(config)
            .into_shared();
        Ok(Self {
            runtime,
            path,
            _dir: dir,
        })
    }

    pub fn runtime(&self) -> &Arc<PersistenceRuntime> {
        &self.runtime
    }

    /// Open a context over a fresh connection to the shared file.
    pub fn open(&self) -> Result<(ExecutionContext, BackendProbe), StorageError> {
        let (backend, probe) = RecordingBackend::new(SqliteStorage::open(&self.path)?);
        Ok((self.runtime.open_context(Box::new(backend)), probe))
    }

    /// Same as [`open`](Self::open) with queued updates switched on.
    pub fn open_queued(
        &self,
    ) -> Result<(ExecutionContext, BackendProbe), Box<dyn std::error::Error>> {
        let (mut ctx, probe) = self.open()?;
        ctx.set_property(objstate_engine::config::PROPERTY_QUEUED_UPDATES, "true")?;
        Ok((ctx, probe))
    }

    /// A separate connection for inspecting what was written.
    pub fn storage(&self) -> Result<SqliteStorage, StorageError> {
        SqliteStorage::open(&self.path)
    }

    /// Every stored field of `id`, or `None` when it was never written.
    pub fn stored(
        &self,
        class_name: &str,
        id: ObjectId,
    ) -> Result<Option<Vec<(usize, FieldData)>>, Box<dyn std::error::Error>> {
        use objstate_storage::PersistenceHandler;

        let mut storage = self.storage()?;
        if storage.exists(id)?.is_none() {
            return Ok(None);
        }
        let class = self.runtime.class(class_name)?;
        Ok(Some(storage.snapshot(id, &class)?))
    }

    /// One stored field of `id`.
    pub fn stored_field(
        &self,
        class_name: &str,
        id: ObjectId,
        field: usize,
    ) -> Result<Option<FieldData>, Box<dyn std::error::Error>> {
        Ok(self.stored(class_name, id)?.and_then(|fields| {
            fields
                .into_iter()
                .find(|(number, _)| *number == field)
                .map(|(_, data)| data)
        }))
    }
}

/// Sorted copy of a collection field, for order-insensitive comparison.
pub fn sorted(data: &FieldData) -> Vec<Value> {
    let mut items = data.as_collection().map(<[_]>::to_vec).unwrap_or_default();
    items.sort();
    items
}
