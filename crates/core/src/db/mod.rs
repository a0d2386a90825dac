//! SQLite backing for the durable document store.
//!
//! [`Database`] owns one connection in WAL mode and keeps the schema current
//! through [`schema::run_migrations`]. The row-level helpers live in
//! [`queries`].

pub mod queries;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// How long a writer waits on a locked file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite connection shared across tasks.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `path`, creating its directory
    /// if needed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(journal_mode = %mode, "database pragmas applied");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// A private database that lives as long as the handle.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        })
    }

    /// File backing this database; `None` for in-memory handles.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply any migrations the file has not seen yet.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let version = schema::run_migrations(&conn)?;
        debug!(version, "database schema is up to date");
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered; SQLite rolls back
    /// whatever the panicking holder left unfinished.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction, committing only if it returns `Ok`.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }
}
