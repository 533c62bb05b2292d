//! Sqlite-backed brain store: one `datum` table, key to JSON text.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use super::{BrainError, BrainStore};

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BrainError> {
        let db = Connection::open(path.as_ref())
            .map_err(|e| BrainError::Init(format!("opening {:?}: {e}", path.as_ref())))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS datum (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )
        .map_err(|e| BrainError::Init(e.to_string()))?;
        info!("sqlite brain store at {:?}", path.as_ref());
        Ok(SqliteStore { db: Mutex::new(db) })
    }
}

impl BrainStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, BrainError> {
        let db = self
            .db
            .lock()
            .map_err(|_| BrainError::Store("connection mutex poisoned".into()))?;
        db.query_row(
            "SELECT value FROM datum WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| BrainError::Store(e.to_string()))
    }

    fn put(&self, key: &str, value: &str) -> Result<(), BrainError> {
        let db = self
            .db
            .lock()
            .map_err(|_| BrainError::Store("connection mutex poisoned".into()))?;
        db.execute(
            "INSERT OR REPLACE INTO datum (key, value, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, value],
        )
        .map_err(|e| BrainError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brain.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("ns:memo", r#"{"n":1}"#).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("ns:memo").unwrap().as_deref(), Some(r#"{"n":1}"#));
        assert!(store.get("ns:other").unwrap().is_none());
    }

    #[test]
    fn replace_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("brain.db")).unwrap();
        store.put("k", "a").unwrap();
        store.put("k", "b").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("b"));
    }
}
