//! Document store abstraction and backends.
//!
//! The core never talks to a concrete store directly. Everything goes through
//! [`DocumentStore`]: a full snapshot, batch writes, per-revision fetches, a
//! change feed and a catch-up query over it. Two backends are provided:
//! - [`MemoryStore`] -- in-process, used by tests and embedders.
//! - [`SqliteStore`] -- durable, backed by the SQLite [`crate::db::Database`].
//!
//! Stores that can exchange revision trees also implement [`Replica`], which
//! is how divergent writes from different replicas meet and become conflicts.

pub mod memory;
pub mod revtree;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::models::{ChangeEvent, RowWriteResult, WriteBatch};

pub use memory::MemoryStore;
pub use revtree::{Leaf, RevTree};
pub use sqlite::SqliteStore;

/// Default capacity of a store's change feed channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// The replicated document store the core reads from and writes to.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Full snapshot: the winning revision of every document, tombstones
    /// included.
    async fn list_all(&self) -> Result<Vec<Value>, StoreError>;

    /// Apply a batch. The batch is rejected as a whole only when the store
    /// cannot be written at all; otherwise each row gets its own outcome.
    /// Rows naming the same id apply all-or-nothing: if one is rejected,
    /// none of them is written.
    async fn bulk_write(&self, batch: &WriteBatch) -> Result<Vec<RowWriteResult>, StoreError>;

    /// Fetch specific revisions of one document. A missing revision fails
    /// only its own slot.
    async fn fetch_revisions(&self, id: &str, revs: &[String]) -> Vec<Result<Value, StoreError>>;

    /// Subscribe to the change feed. Events are emitted after each batch,
    /// one per touched document, in sequence order.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Current state of every document changed after sequence `since`, in
    /// sequence order. Lets a follower recover events it never received.
    async fn changes_since(&self, since: u64) -> Result<Vec<ChangeEvent>, StoreError>;
}

/// A store whose revision trees can be exchanged with another replica.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Every document's revision tree.
    async fn export_trees(&self) -> Result<Vec<(String, RevTree)>, StoreError>;

    /// Merge leaves from another replica. Returns the number of documents
    /// that changed; each of them is announced on the change feed.
    async fn merge_trees(&self, trees: Vec<(String, RevTree)>) -> Result<usize, StoreError>;
}

/// Pull every revision `source` has into `target`.
pub async fn replicate<S, T>(source: &S, target: &T) -> Result<usize, StoreError>
where
    S: Replica + ?Sized,
    T: Replica + ?Sized,
{
    let trees = source.export_trees().await?;
    debug!(documents = trees.len(), "replicating revision trees");
    let changed = target.merge_trees(trees).await?;
    info!(changed, "replication complete");
    Ok(changed)
}

/// A batch applied to working copies of the trees it touches.
pub(crate) struct AppliedBatch {
    pub results: Vec<RowWriteResult>,
    /// Trees to persist, in first-touched order. Ids with a rejected row are
    /// left out.
    pub changed: Vec<(String, RevTree)>,
}

/// Apply `batch` row by row on copies obtained from `load`.
///
/// Every row of an id that had a rejection reports an error, including rows
/// that applied before the rejection.
pub(crate) fn apply_batch<F>(batch: &WriteBatch, mut load: F) -> Result<AppliedBatch, StoreError>
where
    F: FnMut(&str) -> Result<RevTree, StoreError>,
{
    let mut staged: Vec<(String, RevTree)> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    let mut outcomes: Vec<Result<String, String>> = Vec::with_capacity(batch.len());

    for row in batch {
        if failed.contains(&row.id) {
            outcomes.push(Err(format!(
                "not applied: an earlier row for '{}' was rejected",
                row.id
            )));
            continue;
        }
        let idx = match staged.iter().position(|(id, _)| id == &row.id) {
            Some(idx) => idx,
            None => {
                staged.push((row.id.clone(), load(&row.id)?));
                staged.len() - 1
            }
        };
        match staged[idx].1.apply(row) {
            Ok(rev) => {
                debug!(id = %row.id, rev = %rev, "row applied");
                outcomes.push(Ok(rev));
            }
            Err(e) => {
                warn!(id = %row.id, error = %e, "row rejected");
                failed.push(row.id.clone());
                outcomes.push(Err(e.to_string()));
            }
        }
    }

    let results = batch
        .iter()
        .zip(outcomes)
        .map(|(row, outcome)| RowWriteResult {
            id: row.id.clone(),
            outcome: match outcome {
                Ok(_) if failed.contains(&row.id) => Err(format!(
                    "rolled back: another row for '{}' was rejected",
                    row.id
                )),
                other => other,
            },
        })
        .collect();
    staged.retain(|(id, _)| !failed.contains(id));

    Ok(AppliedBatch {
        results,
        changed: staged,
    })
}

/// Merge `incoming` leaves into `tree`, returning whether anything changed.
pub(crate) fn merge_into(tree: &mut RevTree, incoming: &RevTree) -> bool {
    let mut changed = false;
    for leaf in incoming.leaves() {
        changed |= tree.merge_leaf(leaf);
    }
    changed
}
