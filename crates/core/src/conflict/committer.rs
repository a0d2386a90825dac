//! Turning a resolved conflict set into a store write.
//!
//! The revision whose marker the winner carries absorbs the merge result;
//! every other revision in the set is retired with a tombstone. Stores apply
//! one id's rows all-or-nothing, so a plan built from a leaf set that has
//! since changed is rejected whole instead of retiring revisions it never
//! merged.

use tracing::{info, warn};

use crate::errors::StoreError;
use crate::models::{Revision, Row, RowWriteResult, WriteBatch};
use crate::store::DocumentStore;

/// Builds and submits the write batch that settles a conflict set.
pub struct ResolutionCommitter;

impl ResolutionCommitter {
    /// Plan the batch for `winning` over the full list of revisions.
    ///
    /// The winner's row, when it needs one, comes first. A revision that
    /// already equals the winner in marker and payload needs no write.
    pub fn plan(winning: &Revision, revisions: &[Revision]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        let mut seen: Vec<&str> = Vec::new();

        for revision in revisions {
            if seen.contains(&revision.rev.as_str()) {
                continue;
            }
            seen.push(&revision.rev);

            if revision.rev == winning.rev {
                if !revision.same_payload(winning) || revision.deleted != winning.deleted {
                    batch.insert(0, winning.to_row());
                }
            } else {
                batch.push(Row::tombstone(&revision.id, &revision.rev));
            }
        }
        batch
    }

    /// Plan and submit the batch as one write.
    ///
    /// Per-row rejections are logged and returned; they are not retried.
    pub async fn commit<S>(
        store: &S,
        winning: &Revision,
        revisions: &[Revision],
    ) -> Result<Vec<RowWriteResult>, StoreError>
    where
        S: DocumentStore + ?Sized,
    {
        let batch = Self::plan(winning, revisions);
        if batch.is_empty() {
            info!(id = %winning.id, "conflict set already settled, nothing to write");
            return Ok(Vec::new());
        }

        let retired = batch.iter().filter(|r| r.deleted_flag).count();
        info!(
            id = %winning.id,
            winner = %winning.rev,
            retired,
            "committing conflict resolution"
        );

        let results = store.bulk_write(&batch).await?;
        for result in results.iter().filter(|r| !r.is_ok()) {
            if let Err(reason) = &result.outcome {
                warn!(id = %result.id, reason = %reason, "resolution row rejected");
            }
        }
        Ok(results)
    }
}
