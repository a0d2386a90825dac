//! Schema migrations, tracked through SQLite's `user_version` pragma.

use rusqlite::Connection;
use tracing::info;

use crate::errors::DatabaseError;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// Applied in order; never edit one that has shipped.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "documents",
    sql: r#"
        CREATE TABLE IF NOT EXISTS documents (
            id          TEXT PRIMARY KEY,
            tree        TEXT    NOT NULL,
            seq         INTEGER NOT NULL,
            updated_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_seq ON documents (seq);
    "#,
}];

/// Bring `conn` up to the latest schema and return the resulting version.
pub fn run_migrations(conn: &Connection) -> Result<u32, DatabaseError> {
    let start = schema_version(conn)?;
    let mut version = start;

    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        conn.execute_batch(migration.sql)
            .and_then(|()| conn.pragma_update(None, "user_version", migration.version))
            .map_err(|e| DatabaseError::MigrationFailed {
                version: migration.version,
                detail: e.to_string(),
            })?;
        version = migration.version;
    }

    Ok(version)
}

/// The schema version recorded in the file.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_documents_table_and_index() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let names: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(names.iter().any(|n| n == "documents"));
        assert!(names.iter().any(|n| n == "idx_documents_seq"));
    }
}
