//! In-process document store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::revtree::RevTree;
use super::{apply_batch, merge_into, DocumentStore, Replica, DEFAULT_FEED_CAPACITY};
use crate::errors::StoreError;
use crate::models::{ChangeEvent, RowWriteResult, WriteBatch};

#[derive(Default)]
struct State {
    docs: BTreeMap<String, RevTree>,
    /// Sequence number of each document's latest change.
    seqs: BTreeMap<String, u64>,
    seq: u64,
}

impl State {
    fn announce(&mut self, ids: impl IntoIterator<Item = String>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for id in ids {
            if let Some(tree) = self.docs.get(&id) {
                self.seq += 1;
                events.push(tree.change_event(&id, self.seq));
                self.seqs.insert(id, self.seq);
            }
        }
        events
    }
}

/// A document store held entirely in memory.
pub struct MemoryStore {
    state: RwLock<State>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(State::default()),
            feed,
        }
    }

    /// Current revision tree of one document.
    pub async fn tree(&self, id: &str) -> Option<RevTree> {
        self.state.read().await.docs.get(id).cloned()
    }

    /// Last sequence number handed out on the change feed.
    pub async fn last_seq(&self) -> u64 {
        self.state.read().await.seq
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No subscribers is not an error.
            let _ = self.feed.send(event);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<Value>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .docs
            .iter()
            .filter_map(|(id, tree)| tree.winner().map(|leaf| leaf.to_doc(id)))
            .collect())
    }

    async fn bulk_write(&self, batch: &WriteBatch) -> Result<Vec<RowWriteResult>, StoreError> {
        let mut state = self.state.write().await;
        let applied = apply_batch(batch, |id| Ok(state.docs.get(id).cloned().unwrap_or_default()))?;

        let mut touched = Vec::with_capacity(applied.changed.len());
        for (id, tree) in applied.changed {
            state.docs.insert(id.clone(), tree);
            touched.push(id);
        }
        debug!(rows = batch.len(), documents = touched.len(), "batch written");

        let events = state.announce(touched);
        drop(state);
        self.publish(events);
        Ok(applied.results)
    }

    async fn fetch_revisions(&self, id: &str, revs: &[String]) -> Vec<Result<Value, StoreError>> {
        let state = self.state.read().await;
        let tree = state.docs.get(id);
        revs.iter()
            .map(|rev| {
                tree.and_then(|t| t.leaf(rev))
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
        let state = self.state.read().await;
        let mut events: Vec<ChangeEvent> = state
            .seqs
            .iter()
            .filter(|(_, seq)| **seq > since)
            .filter_map(|(id, seq)| state.docs.get(id).map(|tree| tree.change_event(id, *seq)))
            .collect();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}

#[async_trait]
impl Replica for MemoryStore {
    async fn export_trees(&self) -> Result<Vec<(String, RevTree)>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .docs
            .iter()
            .map(|(id, tree)| (id.clone(), tree.clone()))
            .collect())
    }

    async fn merge_trees(&self, trees: Vec<(String, RevTree)>) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut changed = Vec::new();
        for (id, incoming) in trees {
            let tree = state.docs.entry(id.clone()).or_default();
            if merge_into(tree, &incoming) {
                changed.push(id);
            }
        }
        let count = changed.len();
        let events = state.announce(changed);
        drop(state);
        self.publish(events);
        Ok(count)
    }
}
