//! Diff-and-save: write only the rows that changed.
//!
//! [`SaveEngine::save`] reads the store's snapshot, diffs the desired node
//! map against it by value, and submits the difference as one batch. A node
//! whose stored row is already identical is never re-sent. The read always
//! completes before the write is issued; there is no isolation from other
//! writers in between, and a lost race surfaces later as a conflict.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::codec::{self, Decoded};
use crate::errors::{SaveError, StoreError};
use crate::models::{NodeMap, Row, RowWriteResult, WriteBatch};
use crate::store::DocumentStore;

/// Summary of one save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Rows submitted in the batch.
    pub submitted: usize,
    /// Per-row outcomes from the store.
    pub results: Vec<RowWriteResult>,
}

impl SaveReport {
    pub fn written(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &RowWriteResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }
}

/// Rows of `desired` with no structurally equal row in `snapshot`.
pub fn diff(snapshot: &[Row], desired: &NodeMap) -> WriteBatch {
    codec::to_rows(desired)
        .into_iter()
        .filter(|row| !snapshot.contains(row))
        .collect()
}

/// Persists the editor's node map into a document store.
pub struct SaveEngine<S: ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> SaveEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Decode the whole store into a node map, tombstones included.
    pub async fn load(&self) -> Result<Decoded, StoreError> {
        let docs = self.store.list_all().await.map_err(|e| {
            warn!(error = %e, "loading snapshot failed");
            e
        })?;
        let decoded = codec::from_rows(&docs);
        info!(
            nodes = decoded.nodes.len(),
            malformed = decoded.errors.len(),
            "loaded node map"
        );
        Ok(decoded)
    }

    /// Save `nodes`, writing back the new revision marker of every row the
    /// store accepted.
    pub async fn save(&self, nodes: &mut NodeMap) -> Result<SaveReport, SaveError> {
        let docs = self.store.list_all().await.map_err(|e| {
            warn!(error = %e, "snapshot read failed, aborting save");
            SaveError::SnapshotRead(e)
        })?;

        let mut snapshot = Vec::with_capacity(docs.len());
        for doc in &docs {
            match codec::decode_row(doc) {
                Ok(row) => snapshot.push(row),
                Err(e) => warn!(id = %e.id, detail = %e.detail, "ignoring malformed snapshot row"),
            }
        }

        let batch = diff(&snapshot, nodes);
        debug!(
            desired = nodes.len(),
            stored = snapshot.len(),
            changed = batch.len(),
            "computed save diff"
        );
        if batch.is_empty() {
            return Ok(SaveReport::default());
        }

        let results = self.store.bulk_write(&batch).await.map_err(|e| {
            error!(error = %e, rows = batch.len(), "batch write failed");
            SaveError::Write(e)
        })?;

        for result in &results {
            match &result.outcome {
                Ok(rev) => {
                    if let Some(node) = nodes.get_mut(&result.id) {
                        node.rev = Some(rev.clone());
                    }
                }
                Err(reason) => warn!(id = %result.id, reason = %reason, "row not saved"),
            }
        }

        let report = SaveReport {
            submitted: batch.len(),
            results,
        };
        info!(
            submitted = report.submitted,
            written = report.written(),
            "saved node map"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::*;
    use crate::models::{ChangeEvent, Node};
    use crate::store::MemoryStore;

    fn outline() -> NodeMap {
        let mut nodes = NodeMap::new();
        nodes.insert("root".into(), Node::new("root", vec!["a".into(), "b".into()]));
        nodes.insert("a".into(), Node::new("alpha", vec![]));
        nodes.insert("b".into(), Node::new("beta", vec![]));
        nodes
    }

    /// A store whose reads or writes can be made to fail.
    struct FlakyStore {
        fail_reads: bool,
        writes: AtomicUsize,
        feed: broadcast::Sender<ChangeEvent>,
    }

    impl FlakyStore {
        fn new(fail_reads: bool) -> Self {
            Self {
                fail_reads,
                writes: AtomicUsize::new(0),
                feed: broadcast::channel(4).0,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn list_all(&self) -> Result<Vec<Value>, StoreError> {
            if self.fail_reads {
                Err(StoreError::Read("offline".into()))
            } else {
                Ok(Vec::new())
            }
        }

        async fn bulk_write(&self, _batch: &WriteBatch) -> Result<Vec<RowWriteResult>, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Write("disk full".into()))
        }

        async fn fetch_revisions(
            &self,
            _id: &str,
            revs: &[String],
        ) -> Vec<Result<Value, StoreError>> {
            revs.iter().map(|_| Err(StoreError::Read("offline".into()))).collect()
        }

        fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
            self.feed.subscribe()
        }

        async fn changes_since(&self, _since: u64) -> Result<Vec<ChangeEvent>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_diff_skips_identical_rows() {
        let nodes = outline();
        let snapshot = codec::to_rows(&nodes);
        assert!(diff(&snapshot, &nodes).is_empty());

        let mut edited = nodes.clone();
        edited.get_mut("a").unwrap().content = "alpha!".into();
        let batch = diff(&snapshot, &edited);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "a");
    }

    #[test]
    fn test_diff_compares_by_value_including_marker() {
        let nodes = outline();
        let mut snapshot = codec::to_rows(&nodes);
        for row in &mut snapshot {
            row.revision_marker = Some("1-x".into());
        }
        assert_eq!(diff(&snapshot, &nodes).len(), 3);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store.clone());
        let mut nodes = outline();

        let first = engine.save(&mut nodes).await.unwrap();
        assert_eq!(first.submitted, 3);
        assert_eq!(first.written(), 3);
        assert!(nodes.values().all(|n| n.rev.is_some()));

        let second = engine.save(&mut nodes).await.unwrap();
        assert_eq!(second.submitted, 0);
        assert!(second.results.is_empty());
    }

    #[tokio::test]
    async fn test_save_sends_only_changed_nodes() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store.clone());
        let mut nodes = outline();
        engine.save(&mut nodes).await.unwrap();

        nodes.get_mut("b").unwrap().children.push("c".into());
        nodes.insert("c".into(), Node::new("gamma", vec![]));
        let report = engine.save(&mut nodes).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.written(), 2);
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store);
        let mut nodes = outline();
        engine.save(&mut nodes).await.unwrap();

        let loaded = engine.load().await.unwrap();
        assert!(loaded.is_clean());
        assert_eq!(loaded.nodes, nodes);
    }

    #[tokio::test]
    async fn test_soft_delete_is_saved_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store);
        let mut nodes = outline();
        engine.save(&mut nodes).await.unwrap();

        let node = nodes.get_mut("a").unwrap();
        node.deleted = true;
        node.content.clear();
        let report = engine.save(&mut nodes).await.unwrap();
        assert_eq!(report.written(), 1);

        let again = engine.save(&mut nodes).await.unwrap();
        assert_eq!(again.submitted, 0);
        assert!(engine.load().await.unwrap().nodes["a"].deleted);
    }

    #[tokio::test]
    async fn test_soft_deleted_node_keeps_content_and_saves_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store);
        let mut nodes = NodeMap::new();
        nodes.insert("a".into(), Node::new("keep me", vec!["c".into()]));
        nodes.insert("c".into(), Node::new("child", vec![]));
        engine.save(&mut nodes).await.unwrap();

        nodes.get_mut("a").unwrap().deleted = true;
        let mut submitted = Vec::new();
        for _ in 0..3 {
            submitted.push(engine.save(&mut nodes).await.unwrap().submitted);
        }
        assert_eq!(submitted, vec![1, 0, 0]);

        let loaded = engine.load().await.unwrap().nodes;
        assert!(loaded["a"].deleted);
        assert_eq!(loaded["a"].content, "keep me");
        assert_eq!(loaded["a"].children, vec!["c"]);
        assert_eq!(loaded, nodes);
    }

    #[tokio::test]
    async fn test_stale_marker_is_rejected_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let engine = SaveEngine::new(store);
        let mut nodes = outline();
        engine.save(&mut nodes).await.unwrap();

        let mut stale = nodes.clone();
        nodes.get_mut("a").unwrap().content = "newer".into();
        engine.save(&mut nodes).await.unwrap();

        stale.get_mut("a").unwrap().content = "older".into();
        let report = engine.save(&mut stale).await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.rejected().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_read_writes_nothing() {
        let store = Arc::new(FlakyStore::new(true));
        let engine = SaveEngine::new(store.clone());
        let mut nodes = outline();

        let err = engine.save(&mut nodes).await.unwrap_err();
        assert!(matches!(err, SaveError::SnapshotRead(_)));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_surfaced_without_retry() {
        let store = Arc::new(FlakyStore::new(false));
        let engine = SaveEngine::new(store.clone());
        let mut nodes = outline();

        let err = engine.save(&mut nodes).await.unwrap_err();
        assert!(matches!(err, SaveError::Write(_)));
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert!(nodes.values().all(|n| n.rev.is_none()));
    }
}
