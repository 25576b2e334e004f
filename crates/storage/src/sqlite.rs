use rusqlite::{Connection, OptionalExtension, Savepoint};
use tracing::trace;

use objstate_core::{
    ids::ObjectId,
    metadata::{ClassMeta, ContainerShape},
    operations::{Operation, OperationKind, OperationPayload},
    value::{FieldData, Value},
};

use crate::error::StorageError;
use crate::generation::SequenceSource;
use crate::traits::{MapFetch, ObjectHeader, ObjectRecord, PersistenceHandler};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn encode(value: &Value) -> Result<Vec<u8>, StorageError> {
    value
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Value, StorageError> {
    Value::from_msgpack(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub struct SqliteStorage {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn object_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Every field of the object, as currently stored.
    pub fn snapshot(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
    ) -> Result<Vec<(usize, FieldData)>, StorageError> {
        let all: Vec<usize> = (0..class.field_count()).collect();
        self.load(object_id, class, &all)
    }
}

fn read_scalar(
    conn: &Connection,
    object_id: ObjectId,
    field: usize,
) -> Result<Value, StorageError> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM fields WHERE object_id = ?1 AND field_number = ?2",
            rusqlite::params![object_id.as_bytes().as_slice(), field as i64],
            |row| row.get(0),
        )
        .optional()?;
    match bytes {
        Some(bytes) => decode(&bytes),
        None => Ok(Value::Null),
    }
}

fn read_elements(
    conn: &Connection,
    object_id: ObjectId,
    field: usize,
) -> Result<Vec<(Option<Vec<u8>>, Vec<u8>)>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT map_key, element FROM elements WHERE object_id = ?1 AND field_number = ?2 ORDER BY position",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![object_id.as_bytes().as_slice(), field as i64],
        |row| Ok((row.get::<_, Option<Vec<u8>>>(0)?, row.get::<_, Vec<u8>>(1)?)),
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn write_field(
    sp: &Savepoint,
    object_id: ObjectId,
    field: usize,
    data: &FieldData,
) -> Result<(), StorageError> {
    let oid = object_id.as_bytes().as_slice();
    match data {
        FieldData::Scalar(value) => {
            sp.execute(
                "INSERT INTO fields (object_id, field_number, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(object_id, field_number) DO UPDATE SET value = excluded.value",
                rusqlite::params![oid, field as i64, encode(value)?],
            )?;
        }
        FieldData::Collection(items) => {
            sp.execute(
                "DELETE FROM elements WHERE object_id = ?1 AND field_number = ?2",
                rusqlite::params![oid, field as i64],
            )?;
            for (position, item) in items.iter().enumerate() {
                sp.execute(
                    "INSERT INTO elements (object_id, field_number, position, element, map_key) VALUES (?1, ?2, ?3, ?4, NULL)",
                    rusqlite::params![oid, field as i64, position as i64, encode(item)?],
                )?;
            }
        }
        FieldData::Map(entries) => {
            sp.execute(
                "DELETE FROM elements WHERE object_id = ?1 AND field_number = ?2",
                rusqlite::params![oid, field as i64],
            )?;
            for (position, (key, value)) in entries.iter().enumerate() {
                sp.execute(
                    "INSERT INTO elements (object_id, field_number, position, element, map_key) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        oid,
                        field as i64,
                        position as i64,
                        encode(value)?,
                        encode(key)?
                    ],
                )?;
            }
        }
    }
    Ok(())
}

fn next_position(sp: &Savepoint, oid: &[u8], field: usize) -> Result<i64, StorageError> {
    let next: i64 = sp.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM elements WHERE object_id = ?1 AND field_number = ?2",
        rusqlite::params![oid, field as i64],
        |row| row.get(0),
    )?;
    Ok(next)
}

/// Delete the element row at `position` and close the gap.
fn remove_at_position(
    sp: &Savepoint,
    oid: &[u8],
    field: usize,
    position: i64,
) -> Result<bool, StorageError> {
    let removed = sp.execute(
        "DELETE FROM elements WHERE object_id = ?1 AND field_number = ?2 AND position = ?3",
        rusqlite::params![oid, field as i64, position],
    )?;
    if removed > 0 {
        sp.execute(
            "UPDATE elements SET position = position - 1 WHERE object_id = ?1 AND field_number = ?2 AND position > ?3",
            rusqlite::params![oid, field as i64, position],
        )?;
    }
    Ok(removed > 0)
}

fn apply_op(sp: &Savepoint, op: &Operation, class: &ClassMeta) -> Result<(), StorageError> {
    let meta = class.member(op.field)?;
    let shape = meta.container.ok_or_else(|| {
        StorageError::ConstraintViolation(format!(
            "field {} of {} is not a container",
            meta.name, class.name
        ))
    })?;
    let oid = op.owner.as_bytes().as_slice();
    let field = op.field as i64;

    match (op.kind, &op.payload) {
        (OperationKind::ElementAdd, OperationPayload::Element(element)) => {
            let bytes = encode(element)?;
            if matches!(shape, ContainerShape::Set | ContainerShape::SortedSet) {
                let present: Option<i64> = sp
                    .query_row(
                        "SELECT position FROM elements WHERE object_id = ?1 AND field_number = ?2 AND element = ?3",
                        rusqlite::params![oid, field, bytes],
                        |row| row.get(0),
                    )
                    .optional()?;
                if present.is_some() {
                    return Ok(());
                }
            }
            let position = next_position(sp, oid, op.field)?;
            sp.execute(
                "INSERT INTO elements (object_id, field_number, position, element, map_key) VALUES (?1, ?2, ?3, ?4, NULL)",
                rusqlite::params![oid, field, position, bytes],
            )?;
        }
        (OperationKind::ElementAdd, OperationPayload::Indexed { index, element }) => {
            sp.execute(
                "UPDATE elements SET position = position + 1 WHERE object_id = ?1 AND field_number = ?2 AND position >= ?3",
                rusqlite::params![oid, field, *index as i64],
            )?;
            sp.execute(
                "INSERT INTO elements (object_id, field_number, position, element, map_key) VALUES (?1, ?2, ?3, ?4, NULL)",
                rusqlite::params![oid, field, *index as i64, encode(element)?],
            )?;
        }
        (OperationKind::ElementAdd, OperationPayload::Entry { key, value }) => {
            let key_bytes = encode(key)?;
            let updated = sp.execute(
                "UPDATE elements SET element = ?4 WHERE object_id = ?1 AND field_number = ?2 AND map_key = ?3",
                rusqlite::params![oid, field, key_bytes, encode(value)?],
            )?;
            if updated == 0 {
                let position = next_position(sp, oid, op.field)?;
                sp.execute(
                    "INSERT INTO elements (object_id, field_number, position, element, map_key) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![oid, field, position, encode(value)?, key_bytes],
                )?;
            }
        }
        (OperationKind::ElementRemove, OperationPayload::Element(element)) => {
            let position: Option<i64> = sp
                .query_row(
                    "SELECT MIN(position) FROM elements WHERE object_id = ?1 AND field_number = ?2 AND element = ?3",
                    rusqlite::params![oid, field, encode(element)?],
                    |row| row.get(0),
                )?;
            if let Some(position) = position {
                remove_at_position(sp, oid, op.field, position)?;
            }
        }
        (OperationKind::ElementRemove, OperationPayload::Indexed { index, .. }) => {
            remove_at_position(sp, oid, op.field, *index as i64)?;
        }
        (OperationKind::ElementRemove, OperationPayload::Key(key)) => {
            let position: Option<i64> = sp
                .query_row(
                    "SELECT position FROM elements WHERE object_id = ?1 AND field_number = ?2 AND map_key = ?3",
                    rusqlite::params![oid, field, encode(key)?],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(position) = position {
                remove_at_position(sp, oid, op.field, position)?;
            }
        }
        (kind, payload) => {
            return Err(StorageError::ConstraintViolation(format!(
                "unsupported operation {kind:?} with {payload:?}"
            )));
        }
    }
    Ok(())
}

impl PersistenceHandler for SqliteStorage {
    fn begin(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn exists(&mut self, object_id: ObjectId) -> Result<Option<ObjectHeader>, StorageError> {
        let row: Option<(Vec<u8>, String, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT object_id, class_name, version FROM objects WHERE object_id = ?1",
                rusqlite::params![object_id.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((oid, class_name, version)) => Ok(Some(ObjectHeader {
                object_id: ObjectId::from_bytes(to_array::<16>(oid, "object_id")?),
                class_name,
                version,
            })),
            None => Ok(None),
        }
    }

    fn load(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        fields: &[usize],
    ) -> Result<Vec<(usize, FieldData)>, StorageError> {
        if self.exists(object_id)?.is_none() {
            return Err(StorageError::NotFound(object_id.to_string()));
        }
        let mut result = Vec::with_capacity(fields.len());
        for &field in fields {
            let meta = class.member(field)?;
            let data = if meta.is_map() {
                let mut entries = Vec::new();
                for (key, element) in read_elements(&self.conn, object_id, field)? {
                    let key = key.ok_or_else(|| {
                        StorageError::Serialization(format!(
                            "map entry without key in field {field}"
                        ))
                    })?;
                    entries.push((decode(&key)?, decode(&element)?));
                }
                FieldData::Map(entries)
            } else if meta.is_collection() {
                let mut items = Vec::new();
                for (_, element) in read_elements(&self.conn, object_id, field)? {
                    items.push(decode(&element)?);
                }
                FieldData::Collection(items)
            } else {
                FieldData::Scalar(read_scalar(&self.conn, object_id, field)?)
            };
            result.push((field, data));
        }
        Ok(result)
    }

    fn load_map(
        &mut self,
        object_id: ObjectId,
        class: &ClassMeta,
        field: usize,
    ) -> Result<MapFetch, StorageError> {
        let policy = class.member(field)?.container_policy();
        let mut fetch = MapFetch::default();
        let rows = read_elements(&self.conn, object_id, field)?;

        if policy.keys_have_identity {
            let mut keys = Vec::new();
            for (key, _) in &rows {
                if let Some(key) = key {
                    let key = decode(key)?;
                    if key.is_persistable() && !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            fetch.keys = Some(keys);
        }
        if policy.values_have_identity {
            let mut values = Vec::new();
            for (_, element) in &rows {
                let value = decode(element)?;
                if value.is_persistable() {
                    values.push(value);
                }
            }
            fetch.values = Some(values);
        }
        for (key, element) in rows {
            let key = key.ok_or_else(|| {
                StorageError::Serialization(format!("map entry without key in field {field}"))
            })?;
            fetch.entries.push((decode(&key)?, decode(&element)?));
        }
        Ok(fetch)
    }

    fn insert(&mut self, record: &ObjectRecord) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        let result = sp.execute(
            "INSERT INTO objects (object_id, class_name, version) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                record.object_id.as_bytes().as_slice(),
                record.class_name,
                record.version,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::ConstraintViolation(format!(
                    "object {} already exists",
                    record.object_id
                )));
            }
            Err(e) => return Err(StorageError::Sqlite(e)),
        }
        for (field, data) in &record.fields {
            write_field(&sp, record.object_id, *field, data)?;
        }
        sp.commit()?;
        trace!(
            object = %record.object_id,
            class = %record.class_name,
            fields = record.fields.len(),
            "inserted"
        );
        Ok(())
    }

    fn update(
        &mut self,
        record: &ObjectRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        let oid = record.object_id.as_bytes().as_slice();
        let changed = sp.execute(
            "UPDATE objects SET version = ?2 WHERE object_id = ?1 AND version IS ?3",
            rusqlite::params![oid, record.version, expected_version],
        )?;
        if changed == 0 {
            let found: Option<Option<i64>> = sp
                .query_row(
                    "SELECT version FROM objects WHERE object_id = ?1",
                    rusqlite::params![oid],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match found {
                Some(found) => StorageError::OptimisticConflict {
                    object_id: record.object_id.to_string(),
                    expected: expected_version,
                    found,
                },
                None => StorageError::NotFound(record.object_id.to_string()),
            });
        }
        for (field, data) in &record.fields {
            write_field(&sp, record.object_id, *field, data)?;
        }
        sp.commit()?;
        trace!(
            object = %record.object_id,
            version = ?record.version,
            fields = record.fields.len(),
            "updated"
        );
        Ok(())
    }

    fn delete(
        &mut self,
        object_id: ObjectId,
        _class: &ClassMeta,
        version: Option<i64>,
    ) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        let oid = object_id.as_bytes().as_slice();
        let found: Option<Option<i64>> = sp
            .query_row(
                "SELECT version FROM objects WHERE object_id = ?1",
                rusqlite::params![oid],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            None => return Err(StorageError::NotFound(object_id.to_string())),
            Some(found) if found != version => {
                return Err(StorageError::OptimisticConflict {
                    object_id: object_id.to_string(),
                    expected: version,
                    found,
                });
            }
            Some(_) => {}
        }
        sp.execute("DELETE FROM elements WHERE object_id = ?1", rusqlite::params![oid])?;
        sp.execute("DELETE FROM fields WHERE object_id = ?1", rusqlite::params![oid])?;
        sp.execute("DELETE FROM objects WHERE object_id = ?1", rusqlite::params![oid])?;
        sp.commit()?;
        Ok(())
    }

    fn apply(&mut self, op: &Operation, class: &ClassMeta) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        apply_op(&sp, op, class)?;
        sp.commit()?;
        trace!(object = %op.owner, field = op.field, kind = ?op.kind, "applied");
        Ok(())
    }

    fn sequence_source(&mut self) -> Option<&mut dyn SequenceSource> {
        Some(self)
    }
}

impl SequenceSource for SqliteStorage {
    fn allocate_block(
        &mut self,
        sequence: &str,
        size: u64,
        floor: i64,
    ) -> Result<i64, StorageError> {
        let sp = self.conn.savepoint()?;
        sp.execute(
            "INSERT OR IGNORE INTO sequences (name, next_value) VALUES (?1, 1)",
            rusqlite::params![sequence],
        )?;
        sp.execute(
            "UPDATE sequences SET next_value = MAX(next_value, ?2) WHERE name = ?1",
            rusqlite::params![sequence, floor],
        )?;
        let first: i64 = sp.query_row(
            "SELECT next_value FROM sequences WHERE name = ?1",
            rusqlite::params![sequence],
            |row| row.get(0),
        )?;
        sp.execute(
            "UPDATE sequences SET next_value = next_value + ?2 WHERE name = ?1",
            rusqlite::params![sequence, size as i64],
        )?;
        sp.commit()?;
        Ok(first)
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}
