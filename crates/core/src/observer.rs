//! Change feed consumer.
//!
//! [`ChangeObserver`] turns store change events into [`NodeEvent`]s for the
//! outline editor. Each event takes one of three paths:
//!
//! 1. **Deleted** -- forwarded as [`NodeEvent::Deleted`]; the store is not
//!    touched.
//! 2. **Conflicted** -- the competing revisions are fetched, folded into a
//!    winner and committed. Nothing is forwarded: the commit produces a new,
//!    clean change event that flows through path 3.
//! 3. **Clean** -- the document is decoded and forwarded as
//!    [`NodeEvent::Changed`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::ConflictConfig;
use crate::conflict::{ConflictResolver, ResolutionCommitter};
use crate::errors::{ConflictError, CoreError, DecodeError};
use crate::models::{ChangeEvent, Node, NodeEvent, Revision};
use crate::store::DocumentStore;

/// What happened to one conflicted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub id: String,
    pub winner: String,
    /// Rows the store accepted.
    pub written: usize,
    /// Rows the store rejected (typically a newer write got there first).
    pub rejected: usize,
}

/// Consumes a store's change feed and resolves conflicts as they appear.
pub struct ChangeObserver<S: ?Sized> {
    store: Arc<S>,
    resolver: ConflictResolver,
}

impl<S: ?Sized> Clone for ChangeObserver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: self.resolver.clone(),
        }
    }
}

impl<S: DocumentStore + ?Sized> ChangeObserver<S> {
    pub fn new(store: Arc<S>, config: ConflictConfig) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(config),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Process one event. Returns the event to forward downstream, if any.
    pub async fn handle(&self, event: ChangeEvent) -> Result<Option<NodeEvent>, CoreError> {
        if event.deleted {
            debug!(id = %event.id, seq = event.seq, "node deleted");
            return Ok(Some(NodeEvent::Deleted { id: event.id }));
        }

        if event.is_conflicted() {
            self.resolve(&event).await?;
            return Ok(None);
        }

        let fields = self.normalize(&event)?;
        debug!(id = %event.id, seq = event.seq, "node changed");
        Ok(Some(NodeEvent::Changed {
            id: event.id,
            fields,
        }))
    }

    /// Resolve the conflict set announced by `event` and commit the result.
    pub async fn resolve(&self, event: &ChangeEvent) -> Result<ResolutionOutcome, CoreError> {
        let id = event.id.as_str();
        info!(id, competing = event.competing.len(), "resolving conflict");

        let responses = self.store.fetch_revisions(id, &event.competing).await;
        let mut revisions: Vec<Revision> = Vec::with_capacity(responses.len() + 1);
        for (rev, response) in event.competing.iter().zip(responses) {
            match response.map_err(CoreError::from).and_then(|doc| {
                codec::decode_revision(&doc).map_err(CoreError::from)
            }) {
                Ok(revision) => revisions.push(revision),
                Err(e) => warn!(id, rev = %rev, error = %e, "excluding unavailable revision"),
            }
        }

        if let Some(doc) = &event.doc {
            revisions.push(codec::decode_revision(doc)?);
        }
        if revisions.is_empty() {
            return Err(ConflictError::EmptyConflictSet(id.to_string()).into());
        }

        let winning = self.resolver.fold(id, revisions.clone()).map_err(|e| {
            error!(id, error = %e, "conflict resolution failed");
            e
        })?;

        let results = ResolutionCommitter::commit(self.store.as_ref(), &winning, &revisions).await?;
        let written = results.iter().filter(|r| r.is_ok()).count();
        let outcome = ResolutionOutcome {
            id: id.to_string(),
            winner: winning.rev,
            written,
            rejected: results.len() - written,
        };
        info!(
            id,
            winner = %outcome.winner,
            written = outcome.written,
            rejected = outcome.rejected,
            "conflict resolution committed"
        );
        Ok(outcome)
    }

    fn normalize(&self, event: &ChangeEvent) -> Result<Node, DecodeError> {
        let doc = event.doc.as_ref().ok_or_else(|| DecodeError {
            id: event.id.clone(),
            detail: "change event carries no document".into(),
        })?;
        let row = codec::decode_row(doc)?;
        Ok(codec::normalize(&row))
    }
}

impl<S: DocumentStore + ?Sized> ChangeObserver<S> {
    /// Follow `feed` until it closes, forwarding node events to `sink`.
    ///
    /// Events are handled in feed order. Conflicted events are resolved on
    /// their own tasks so resolutions for different ids overlap; an id never
    /// has two resolutions running. A conflicted event arriving while its
    /// id is being resolved is held and resolved afterwards, unless a newer
    /// event for the id supersedes it. A failed resolution is forwarded as
    /// [`NodeEvent::ResolutionFailed`].
    ///
    /// If the feed lags, the dropped events are recovered through
    /// [`DocumentStore::changes_since`]. Returns early if `sink` is dropped.
    pub async fn run(self, mut feed: broadcast::Receiver<ChangeEvent>, sink: mpsc::Sender<NodeEvent>) {
        let mut resolutions = Resolutions::new(self.clone());
        let mut last_seq = 0u64;
        info!("change observer started");

        loop {
            let keep_going = tokio::select! {
                received = feed.recv() => {
                    let events = match received {
                        Ok(event) => vec![event],
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            self.catch_up(skipped, last_seq).await
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("change feed closed");
                            break;
                        }
                    };
                    let mut open = true;
                    for event in events {
                        last_seq = last_seq.max(event.seq);
                        if !self.dispatch(event, &mut resolutions, &sink).await {
                            open = false;
                            break;
                        }
                    }
                    open
                }
                Some(joined) = resolutions.join_next(), if !resolutions.is_empty() => {
                    match resolutions.finish(joined) {
                        Some(done) => forward_resolution(done, &sink).await,
                        None => true,
                    }
                }
            };
            if !keep_going {
                warn!("node event sink closed, stopping observer");
                break;
            }
        }

        while let Some(joined) = resolutions.join_next().await {
            if let Some(done) = resolutions.finish(joined) {
                if !forward_resolution(done, &sink).await {
                    break;
                }
            }
        }
        info!("change observer stopped");
    }

    /// Route one event. Returns `false` once the sink is gone.
    async fn dispatch(
        &self,
        event: ChangeEvent,
        resolutions: &mut Resolutions<S>,
        sink: &mpsc::Sender<NodeEvent>,
    ) -> bool {
        if event.is_conflicted() && !event.deleted {
            resolutions.submit(event);
            return true;
        }

        resolutions.supersede(&event.id);
        let id = event.id.clone();
        match self.handle(event).await {
            Ok(Some(node_event)) => sink.send(node_event).await.is_ok(),
            Ok(None) => true,
            Err(e) => {
                error!(id = %id, error = %e, "failed to process change");
                true
            }
        }
    }

    /// Events the feed dropped, read back from the store.
    async fn catch_up(&self, skipped: u64, since: u64) -> Vec<ChangeEvent> {
        warn!(skipped, since, "change feed lagged, catching up from the store");
        match self.store.changes_since(since).await {
            Ok(events) => {
                info!(recovered = events.len(), "caught up after lag");
                events
            }
            Err(e) => {
                error!(error = %e, "catch-up after lag failed, dropped events are lost");
                Vec::new()
            }
        }
    }
}

type Finished = (String, Result<ResolutionOutcome, CoreError>);

/// Resolutions in flight, at most one per id.
struct Resolutions<S: ?Sized> {
    observer: ChangeObserver<S>,
    tasks: JoinSet<Finished>,
    running: HashMap<String, AbortHandle>,
    /// Newest conflicted event seen for an id while it was being resolved.
    queued: HashMap<String, ChangeEvent>,
}

impl<S: DocumentStore + ?Sized> Resolutions<S> {
    fn new(observer: ChangeObserver<S>) -> Self {
        Self {
            observer,
            tasks: JoinSet::new(),
            running: HashMap::new(),
            queued: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    async fn join_next(&mut self) -> Option<Result<Finished, JoinError>> {
        self.tasks.join_next().await
    }

    fn submit(&mut self, event: ChangeEvent) {
        if self.running.contains_key(&event.id) {
            debug!(id = %event.id, seq = event.seq, "resolution already running, holding event");
            self.queued.insert(event.id.clone(), event);
            return;
        }
        let observer = self.observer.clone();
        let id = event.id.clone();
        let handle = self.tasks.spawn(async move {
            let result = observer.resolve(&event).await;
            (event.id, result)
        });
        self.running.insert(id, handle);
    }

    /// A newer clean or deleted state makes a held conflict obsolete.
    fn supersede(&mut self, id: &str) {
        if self.queued.remove(id).is_some() {
            debug!(id, "held conflict superseded by a newer change");
        }
    }

    /// Record a joined task and start the held follow-up for its id.
    fn finish(&mut self, joined: Result<Finished, JoinError>) -> Option<Finished> {
        let ids: Vec<String> = match &joined {
            Ok((id, _)) => vec![id.clone()],
            // A panicked task cannot name its id; release every finished one.
            Err(_) => self
                .running
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect(),
        };
        for id in ids {
            if self.running.get(&id).map_or(false, AbortHandle::is_finished) {
                self.running.remove(&id);
            }
            if !self.running.contains_key(&id) {
                if let Some(next) = self.queued.remove(&id) {
                    self.submit(next);
                }
            }
        }

        match joined {
            Ok(done) => Some(done),
            Err(e) => {
                error!(error = %e, "resolution task panicked");
                None
            }
        }
    }
}

/// Report a finished resolution. Returns `false` once the sink is gone.
async fn forward_resolution((id, result): Finished, sink: &mpsc::Sender<NodeEvent>) -> bool {
    match result {
        Ok(outcome) => {
            debug!(id = %id, winner = %outcome.winner, "resolution finished");
            true
        }
        Err(e) => {
            error!(id = %id, error = %e, "conflict left unresolved");
            sink.send(NodeEvent::ResolutionFailed {
                id,
                reason: e.to_string(),
            })
            .await
            .is_ok()
        }
    }
}
