//! SQLite connection management
//!
//! One connection behind a mutex, opened in WAL mode for file databases.
//! Writers hold the mutex for the whole transaction, which is what orders
//! change revisions.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::Result;

pub const IN_MEMORY_PATH: &str = ":memory:";

/// SQLite database handle
pub struct Storage {
    db_path: String,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database and bring its schema up to date
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Self::create_connection(db_path)?;
        run_migrations(&conn)?;

        Ok(Self {
            db_path: db_path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database (tests, ephemeral deployments)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(IN_MEMORY_PATH)
    }

    fn create_connection(db_path: &str) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if db_path == IN_MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(db_path, flags)?
        };

        Self::configure_pragmas(&conn)?;
        Ok(conn)
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA wal_autocheckpoint=1000;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Lock the connection for a multi-step operation
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Truncate the WAL file
    pub fn checkpoint(&self) -> Result<()> {
        if self.db_path != IN_MEMORY_PATH {
            let conn = self.conn.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }

    /// Database size in bytes
    pub fn db_size(&self) -> Result<i64> {
        self.with_connection(|conn| {
            let size: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(size)
        })
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), IN_MEMORY_PATH);
        assert!(storage.db_size().unwrap() > 0);
        storage.checkpoint().unwrap();
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("resources.db");
        let storage = Storage::open(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        storage.checkpoint().unwrap();
    }
}
