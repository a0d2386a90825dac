//! Typed query helpers for the `documents` table.
//!
//! The free functions take a plain `&Connection` so they can run inside a
//! [`Database::transaction`]; the methods on [`Database`] are one-shot
//! conveniences around them.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;

/// A row from the `documents` table.
#[derive(Debug, Clone)]
pub struct DocumentEntry {
    pub id: String,
    /// JSON-serialized revision tree.
    pub tree: String,
    pub seq: i64,
    pub updated_at: String,
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentEntry> {
    Ok(DocumentEntry {
        id: row.get(0)?,
        tree: row.get(1)?,
        seq: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/// Load one document's serialized tree.
pub fn load_tree(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    let tree = conn
        .query_row(
            "SELECT tree FROM documents WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(tree)
}

/// Insert or replace one document's tree and stamp it with `seq`.
pub fn store_tree(conn: &Connection, id: &str, tree: &str, seq: i64) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO documents (id, tree, seq, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET tree = excluded.tree, seq = excluded.seq,
                                       updated_at = excluded.updated_at",
        params![id, tree, seq, now],
    )?;
    debug!(id, seq, "stored document tree");
    Ok(())
}

/// Highest sequence number handed out so far (0 for an empty store).
pub fn max_seq(conn: &Connection) -> Result<i64, DatabaseError> {
    let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM documents", [], |row| {
        row.get(0)
    })?;
    Ok(seq)
}

/// Every document, ordered by id.
pub fn list_documents(conn: &Connection) -> Result<Vec<DocumentEntry>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id, tree, seq, updated_at FROM documents ORDER BY id")?;
    let rows = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Documents changed after `since`, in sequence order.
pub fn documents_since(conn: &Connection, since: i64) -> Result<Vec<DocumentEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, tree, seq, updated_at FROM documents WHERE seq > ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![since], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Database {
    /// Every document, ordered by id.
    pub fn list_documents(&self) -> Result<Vec<DocumentEntry>, DatabaseError> {
        list_documents(&self.conn())
    }

    /// Documents changed after `since`, in sequence order.
    pub fn documents_since(&self, since: i64) -> Result<Vec<DocumentEntry>, DatabaseError> {
        documents_since(&self.conn(), since)
    }

    /// Highest sequence number handed out so far.
    pub fn max_seq(&self) -> Result<i64, DatabaseError> {
        max_seq(&self.conn())
    }
}
