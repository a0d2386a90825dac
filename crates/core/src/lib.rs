//! Outline sync core library.
//!
//! This crate keeps an outline editor's node map in step with a replicated
//! document store: the row codec, diff-based saving, the change feed
//! observer, conflict resolution and commit, and the store backends.

pub mod codec;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod models;
pub mod observer;
pub mod save;
pub mod store;

// Re-exports for convenience.
pub use config::AppConfig;
pub use conflict::{ConflictResolver, Resolution, ResolutionCommitter};
pub use db::Database;
pub use errors::CoreError;
pub use models::{ChangeEvent, Node, NodeEvent, NodeMap, Revision, Row};
pub use observer::ChangeObserver;
pub use save::SaveEngine;
pub use store::{DocumentStore, MemoryStore, Replica, SqliteStore};
