//! Durable document store on top of the SQLite [`Database`].
//!
//! Each document is one row holding its JSON-serialized [`RevTree`]. A batch
//! write runs in a single transaction; change events go out only after it
//! commits.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::revtree::RevTree;
use super::{apply_batch, merge_into, DocumentStore, Replica, DEFAULT_FEED_CAPACITY};
use crate::db::{queries, Database};
use crate::errors::StoreError;
use crate::models::{ChangeEvent, RowWriteResult, WriteBatch};

/// A document store persisted in SQLite.
pub struct SqliteStore {
    db: Database,
    feed: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    /// Open (or create) a store file and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P, feed_capacity: usize) -> Result<Self, StoreError> {
        let db = Database::new(path)?;
        db.initialize()?;
        Ok(Self::with_database(db, feed_capacity))
    }

    /// A throwaway in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::in_memory()?;
        db.initialize()?;
        Ok(Self::with_database(db, DEFAULT_FEED_CAPACITY))
    }

    fn with_database(db: Database, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self { db, feed }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            let _ = self.feed.send(event);
        }
    }
}

fn read_tree(conn: &Connection, id: &str) -> Result<RevTree, StoreError> {
    match queries::load_tree(conn, id)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(RevTree::default()),
    }
}

fn write_tree(
    conn: &Connection,
    id: &str,
    tree: &RevTree,
    seq: &mut i64,
) -> Result<ChangeEvent, StoreError> {
    *seq += 1;
    let json = serde_json::to_string(tree)?;
    queries::store_tree(conn, id, &json, *seq)?;
    Ok(tree.change_event(id, *seq as u64))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn list_all(&self) -> Result<Vec<Value>, StoreError> {
        let entries = self
            .db
            .list_documents()
            .map_err(|e| StoreError::Read(e.to_string()))?;
        let mut docs = Vec::with_capacity(entries.len());
        for entry in entries {
            let tree: RevTree = serde_json::from_str(&entry.tree)?;
            if let Some(leaf) = tree.winner() {
                docs.push(leaf.to_doc(&entry.id));
            }
        }
        Ok(docs)
    }

    async fn bulk_write(&self, batch: &WriteBatch) -> Result<Vec<RowWriteResult>, StoreError> {
        let (results, events) = self
            .db
            .transaction(|conn| -> Result<_, StoreError> {
                let applied = apply_batch(batch, |id| read_tree(conn, id))?;
                let mut seq = queries::max_seq(conn)?;
                let mut events = Vec::with_capacity(applied.changed.len());
                for (id, tree) in &applied.changed {
                    events.push(write_tree(conn, id, tree, &mut seq)?);
                }
                debug!(rows = batch.len(), documents = events.len(), "batch committed");
                Ok((applied.results, events))
            })
            .map_err(|e| match e {
                StoreError::Database(db) => StoreError::Write(db.to_string()),
                other => other,
            })?;

        self.publish(events);
        Ok(results)
    }

    async fn fetch_revisions(&self, id: &str, revs: &[String]) -> Vec<Result<Value, StoreError>> {
        let tree = {
            let conn = self.db.conn();
            read_tree(&conn, id)
        };
        let tree = match tree {
            Ok(tree) => tree,
            Err(e) => {
                warn!(id, error = %e, "failed to read revision tree");
                let reason = e.to_string();
                return revs
                    .iter()
                    .map(|_| Err(StoreError::Read(reason.clone())))
                    .collect();
            }
        };
        revs.iter()
            .map(|rev| {
                tree.leaf(rev)
                    .map(|leaf| leaf.to_doc(id))
                    .ok_or_else(|| StoreError::NotFound {
                        id: id.to_string(),
                        rev: rev.clone(),
                    })
            })
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    async fn changes_since(&self, since: u64) -> Result<Vec<ChangeEvent>, StoreError> {
        let since = i64::try_from(since).unwrap_or(i64::MAX);
        self.db
            .documents_since(since)?
            .into_iter()
            .map(|entry| -> Result<ChangeEvent, StoreError> {
                let tree: RevTree = serde_json::from_str(&entry.tree)?;
                Ok(tree.change_event(&entry.id, entry.seq.max(0) as u64))
            })
            .collect()
    }
}

#[async_trait]
impl Replica for SqliteStore {
    async fn export_trees(&self) -> Result<Vec<(String, RevTree)>, StoreError> {
        self.db
            .list_documents()?
            .into_iter()
            .map(|entry| -> Result<(String, RevTree), StoreError> {
                Ok((entry.id, serde_json::from_str(&entry.tree)?))
            })
            .collect()
    }

    async fn merge_trees(&self, trees: Vec<(String, RevTree)>) -> Result<usize, StoreError> {
        let events = self.db.transaction(|conn| -> Result<_, StoreError> {
            let mut seq = queries::max_seq(conn)?;
            let mut events = Vec::new();
            for (id, incoming) in &trees {
                let mut tree = read_tree(conn, id)?;
                if merge_into(&mut tree, incoming) {
                    events.push(write_tree(conn, id, &tree, &mut seq)?);
                }
            }
            Ok(events)
        })?;
        let count = events.len();
        info!(count, "merged replicated documents");
        self.publish(events);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;
    use crate::store::{replicate, MemoryStore};

    fn row(id: &str, rev: Option<&str>, content: &str) -> Row {
        Row {
            id: id.into(),
            revision_marker: rev.map(String::from),
            content: content.into(),
            children: vec!["c".into()],
            deleted_flag: false,
        }
    }

    #[tokio::test]
    async fn test_write_list_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outline.db");
        {
            let store = SqliteStore::open(&path, 16).unwrap();
            let results = store.bulk_write(&vec![row("a", None, "one")]).await.unwrap();
            assert!(results[0].is_ok());
        }

        let store = SqliteStore::open(&path, 16).unwrap();
        let docs = store.list_all().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["content"], "one");
        assert_eq!(docs[0]["children"][0], "c");
    }

    #[tokio::test]
    async fn test_same_id_twice_in_one_batch() {
        let store = SqliteStore::in_memory().unwrap();
        let first = store.bulk_write(&vec![row("a", None, "v1")]).await.unwrap();
        let rev1 = first[0].outcome.clone().unwrap();

        let mut feed = store.subscribe();
        let results = store
            .bulk_write(&vec![row("a", Some(&rev1), "v2"), row("a", Some(&rev1), "v3")])
            .await
            .unwrap();
        // The second row is stale, so neither row of the id is written.
        assert!(!results[0].is_ok());
        assert!(!results[1].is_ok());
        assert!(feed.try_recv().is_err());

        let docs = store.list_all().await.unwrap();
        assert_eq!(docs[0]["content"], "v1");
        assert_eq!(docs[0]["revisionMarker"], rev1.as_str());

        let results = store
            .bulk_write(&vec![row("a", Some(&rev1), "v2")])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        let event = feed.recv().await.unwrap();
        assert_eq!(event.doc.unwrap()["content"], "v2");
    }

    #[tokio::test]
    async fn test_changes_since() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .bulk_write(&vec![row("a", None, "x"), row("b", None, "y")])
            .await
            .unwrap();
        let all = store.changes_since(0).await.unwrap();
        assert_eq!(all.len(), 2);
        let later = store.changes_since(all[0].seq).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, all[1].id);
    }

    #[tokio::test]
    async fn test_replicates_with_memory_store() {
        let sqlite = SqliteStore::in_memory().unwrap();
        let memory = MemoryStore::new();
        let base = sqlite.bulk_write(&vec![row("a", None, "base")]).await.unwrap();
        let base = base[0].outcome.clone().unwrap();
        replicate(&sqlite, &memory).await.unwrap();

        sqlite
            .bulk_write(&vec![row("a", Some(&base), "disk")])
            .await
            .unwrap();
        memory
            .bulk_write(&vec![row("a", Some(&base), "ram")])
            .await
            .unwrap();

        assert_eq!(replicate(&memory, &sqlite).await.unwrap(), 1);
        let events = sqlite.changes_since(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_conflicted());
    }
}
