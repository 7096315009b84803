// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Metadata store backends for kvfs
//!
//! The tree engine only needs three atomic per-key operations, so any key-value
//! engine that offers them can back a filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::config::{MetaStoreBackend, MetaStoreConfig};
use crate::error::{FsResult, StoreError, StoreResult};

/// Key-value capability consumed by the tree engine. Keys are canonical paths.
#[cfg_attr(test, mockall::automock)]
pub trait MetaStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;
    /// Missing keys are reported as [`StoreError::NotFound`].
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Volatile store backed by a hash map
#[derive(Default)]
pub struct InMemoryMetaStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of the stored keys
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl MetaStore for InMemoryMetaStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    prefix TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (prefix, key)
);
"#;

/// Name of the database file created inside the configured store directory
pub const SQLITE_FILE_NAME: &str = "metadata.db";

/// Durable store in a SQLite database. Every call is a single autocommit statement.
pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
    prefix: String,
}

impl SqliteMetaStore {
    /// Open or create `<dir>/metadata.db`, namespacing every key under `prefix`.
    pub fn open(dir: &Path, prefix: &str) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SQLITE_FILE_NAME);
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), prefix, "opened sqlite metadata store");
        Ok(Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
        })
    }

    /// Database that lives only as long as this handle (for testing).
    pub fn in_memory(prefix: &str) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
        })
    }
}

impl MetaStore for SqliteMetaStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT OR REPLACE INTO entries (prefix, key, value) VALUES (?1, ?2, ?3)",
            params![self.prefix, key, value],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row(
            "SELECT value FROM entries WHERE prefix = ?1 AND key = ?2",
            params![self.prefix, key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "DELETE FROM entries WHERE prefix = ?1 AND key = ?2",
            params![self.prefix, key],
        )?;
        Ok(())
    }
}

/// Build the store described by the configuration
pub fn open_store(config: &MetaStoreConfig) -> FsResult<Arc<dyn MetaStore>> {
    let store: Arc<dyn MetaStore> = match config.backend {
        MetaStoreBackend::Memory => Arc::new(InMemoryMetaStore::new()),
        MetaStoreBackend::Sqlite => Arc::new(SqliteMetaStore::open(&config.dir, &config.prefix)?),
    };
    Ok(store)
}
