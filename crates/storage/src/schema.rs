use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS objects (
    object_id BLOB PRIMARY KEY CHECK (length(object_id) = 16),
    class_name TEXT NOT NULL,
    version INTEGER
);
CREATE INDEX IF NOT EXISTS idx_objects_class ON objects (class_name);

CREATE TABLE IF NOT EXISTS fields (
    object_id BLOB NOT NULL REFERENCES objects (object_id) ON DELETE CASCADE,
    field_number INTEGER NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (object_id, field_number)
);

CREATE TABLE IF NOT EXISTS elements (
    rowid INTEGER PRIMARY KEY,
    object_id BLOB NOT NULL REFERENCES objects (object_id) ON DELETE CASCADE,
    field_number INTEGER NOT NULL,
    position INTEGER NOT NULL,
    element BLOB NOT NULL,
    map_key BLOB
);
CREATE INDEX IF NOT EXISTS idx_elements_owner ON elements (object_id, field_number, position);

CREATE TABLE IF NOT EXISTS sequences (
    name TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL
);
";
