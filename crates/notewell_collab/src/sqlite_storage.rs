//! SQLite-backed storage implementation for document persistence.
//!
//! Persists documents to a single-table SQLite database. This is the durable
//! backend behind [`DebouncedDisk`](crate::disk::DebouncedDisk) on native
//! targets; browser deployments substitute their own [`DiskStorage`].

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::storage::{DiskStorage, StorageResult};
use crate::types::{StoredDoc, Version};

/// SQLite-backed document storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// Creates the necessary table if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collab_docs (
                key TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                version INTEGER NOT NULL,
                modified_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl DiskStorage for SqliteStorage {
    fn load_doc(&self, key: &str) -> StorageResult<Option<StoredDoc>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT content, version, modified_at FROM collab_docs WHERE key = ?",
                params![key],
                |row| {
                    Ok(StoredDoc {
                        content: row.get(0)?,
                        version: row.get::<_, i64>(1)? as Version,
                        modified_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn save_doc(&self, key: &str, content: &str, version: Version) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO collab_docs (key, content, version, modified_at)
             VALUES (?, ?, ?, ?)",
            params![key, content, version as i64, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM collab_docs WHERE key = ?", params![key])?;
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key FROM collab_docs ORDER BY key ASC")?;
        let keys: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(keys)
    }
}
