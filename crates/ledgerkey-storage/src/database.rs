//! Database connection and initialization

use crate::store::KeyValueStore;
use crate::{migrations, Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;

/// SQLite-backed key/value store
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and run migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // journal_mode returns a row, so it cannot go through execute()
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        tracing::debug!("SQLite journal mode: {}", mode);

        Self::init(conn)
    }

    /// Throwaway in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn).map_err(|e| Error::Migration(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version after migrations
    pub fn schema_version(&self) -> Result<i32> {
        migrations::get_schema_version(&self.conn.lock())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_database() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_put_get_delete() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get("preferences").unwrap().is_none());

        db.put("preferences", "{}").unwrap();
        db.put("preferences", "{\"a\":1}").unwrap();
        assert_eq!(db.get("preferences").unwrap().as_deref(), Some("{\"a\":1}"));

        db.delete("preferences").unwrap();
        assert!(db.get("preferences").unwrap().is_none());
    }

    #[test]
    fn test_values_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        {
            let db = Database::open(file.path()).unwrap();
            db.put("vault.envelope", "sealed").unwrap();
        }

        let db = Database::open(file.path()).unwrap();
        assert_eq!(db.get("vault.envelope").unwrap().as_deref(), Some("sealed"));
    }
}
