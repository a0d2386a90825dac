//! Per-document revision bookkeeping shared by every store backend.
//!
//! A [`RevTree`] keeps the current leaf revisions of one node id together
//! with each leaf's ancestry. More than one live leaf means the document is
//! in conflict. Markers are `"{generation}-{hash}"`, where the hash covers
//! the parent marker and the written payload, so two replicas that apply the
//! same write to the same parent mint the same marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::codec::encode_row;
use crate::errors::StoreError;
use crate::models::{marker_generation, ChangeEvent, Row};

/// Hex characters of the payload digest kept in a marker.
const MARKER_HASH_LEN: usize = 32;

/// One leaf revision of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Leaf {
    pub rev: String,
    pub deleted: bool,
    pub content: String,
    pub children: Vec<String>,
    /// Ancestor markers, nearest parent first.
    #[serde(default)]
    pub history: Vec<String>,
}

impl Leaf {
    pub fn generation(&self) -> u64 {
        marker_generation(&self.rev)
    }

    /// The row this leaf represents.
    pub fn to_row(&self, id: &str) -> Row {
        Row {
            id: id.to_string(),
            revision_marker: Some(self.rev.clone()),
            content: self.content.clone(),
            children: self.children.clone(),
            deleted_flag: self.deleted,
        }
    }

    /// The raw document a store hands out for this leaf.
    pub fn to_doc(&self, id: &str) -> Value {
        encode_row(&self.to_row(id))
    }

    fn descends_from(&self, rev: &str) -> bool {
        self.history.iter().any(|r| r == rev)
    }
}

/// The leaf set of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevTree {
    leaves: Vec<Leaf>,
}

impl RevTree {
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// True when every leaf is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.leaves.iter().all(|l| l.deleted)
    }

    /// Deterministic winner: live leaves beat tombstones, then the highest
    /// generation, then the highest marker.
    pub fn winner(&self) -> Option<&Leaf> {
        self.leaves
            .iter()
            .max_by(|a, b| {
                (!a.deleted, a.generation(), &a.rev).cmp(&(!b.deleted, b.generation(), &b.rev))
            })
    }

    /// Markers of live leaves other than the winner, in marker order.
    pub fn competing(&self) -> Vec<String> {
        let winner = self.winner().map(|l| l.rev.as_str());
        let mut revs: Vec<String> = self
            .leaves
            .iter()
            .filter(|l| !l.deleted && Some(l.rev.as_str()) != winner)
            .map(|l| l.rev.clone())
            .collect();
        revs.sort();
        revs
    }

    /// Look up a current leaf by marker.
    pub fn leaf(&self, rev: &str) -> Option<&Leaf> {
        self.leaves.iter().find(|l| l.rev == rev)
    }

    /// Apply one row write and return the new marker.
    ///
    /// A row naming a marker must name a current leaf, which it replaces. A
    /// row without a marker creates the document, or recreates it on top of
    /// the winning tombstone when every leaf is deleted.
    pub fn apply(&mut self, row: &Row) -> Result<String, StoreError> {
        let parent_idx = match &row.revision_marker {
            Some(rev) => Some(
                self.leaves
                    .iter()
                    .position(|l| &l.rev == rev)
                    .ok_or_else(|| StoreError::RevisionConflict {
                        id: row.id.clone(),
                        rev: Some(rev.clone()),
                    })?,
            ),
            None if self.is_empty() => None,
            None if self.is_deleted() => {
                let winner = self.winner().map(|w| w.rev.clone());
                winner.and_then(|rev| self.leaves.iter().position(|l| l.rev == rev))
            }
            None => {
                return Err(StoreError::RevisionConflict {
                    id: row.id.clone(),
                    rev: None,
                })
            }
        };

        let parent = parent_idx.map(|idx| self.leaves.remove(idx));
        let (generation, history) = match &parent {
            Some(p) => {
                let mut history = Vec::with_capacity(p.history.len() + 1);
                history.push(p.rev.clone());
                history.extend(p.history.iter().cloned());
                (p.generation() + 1, history)
            }
            None => (1, Vec::new()),
        };

        // Tombstones keep whatever payload they were written with, so a
        // soft-deleted node reads back exactly as it was saved.
        let rev = mint_marker(
            generation,
            parent.as_ref().map(|p| p.rev.as_str()),
            &row.content,
            &row.children,
            row.deleted_flag,
        )?;

        self.leaves.push(Leaf {
            rev: rev.clone(),
            deleted: row.deleted_flag,
            content: row.content.clone(),
            children: row.children.clone(),
            history,
        });
        Ok(rev)
    }

    /// Merge a leaf replicated from another store.
    ///
    /// Returns `false` when this tree already has the leaf or a descendant of
    /// it. Leaves the incoming one descends from are superseded; any other
    /// live leaf stays and the document becomes conflicted.
    pub fn merge_leaf(&mut self, incoming: &Leaf) -> bool {
        let known = self
            .leaves
            .iter()
            .any(|l| l.rev == incoming.rev || l.descends_from(&incoming.rev));
        if known {
            return false;
        }
        self.leaves.retain(|l| !incoming.descends_from(&l.rev));
        self.leaves.push(incoming.clone());
        true
    }

    /// The change feed entry describing this document's current state.
    pub fn change_event(&self, id: &str, seq: u64) -> ChangeEvent {
        ChangeEvent {
            id: id.to_string(),
            seq,
            deleted: self.is_deleted(),
            doc: self.winner().map(|l| l.to_doc(id)),
            competing: self.competing(),
        }
    }
}

/// Mint a marker from the parent marker and the written payload.
fn mint_marker(
    generation: u64,
    parent: Option<&str>,
    content: &str,
    children: &[String],
    deleted: bool,
) -> Result<String, StoreError> {
    let payload = serde_json::to_vec(&(parent, content, children, deleted))?;
    let digest = hex::encode(Sha256::digest(&payload));
    Ok(format!("{}-{}", generation, &digest[..MARKER_HASH_LEN]))
}
