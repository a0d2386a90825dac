//! Error types for the outline-sync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// A row read from the store did not have the expected shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed row '{id}': {detail}")]
pub struct DecodeError {
    /// Id of the offending row, or `<unknown>` when the id itself is unreadable.
    pub id: String,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Document store errors
// ---------------------------------------------------------------------------

/// Errors from a document store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not produce a snapshot or revision.
    #[error("store read failed: {0}")]
    Read(String),

    /// The store rejected a batch as a whole.
    #[error("store write failed: {0}")]
    Write(String),

    /// The requested revision does not exist.
    #[error("revision {rev} of '{id}' not found")]
    NotFound { id: String, rev: String },

    /// The write named a revision that is not a current leaf.
    #[error("revision conflict on '{id}' (rev {rev:?})")]
    RevisionConflict { id: String, rev: Option<String> },

    /// Underlying database error.
    #[error("store database error: {0}")]
    Database(#[from] DatabaseError),

    /// A stored document could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Diff-and-save errors
// ---------------------------------------------------------------------------

/// Errors from the diff-and-save engine. Neither case is retried.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Reading the snapshot failed; nothing was written.
    #[error("snapshot read failed, nothing written: {0}")]
    SnapshotRead(#[source] StoreError),

    /// Submitting the batch failed.
    #[error("batch write failed: {0}")]
    Write(#[source] StoreError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolution subsystem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    /// The merge fold could not produce a winner.
    #[error("conflict resolution failed for '{id}': {reason}")]
    ResolutionFailed { id: String, reason: String },

    /// Every fetch for the conflict set failed and no changed doc was given.
    #[error("conflict set for '{0}' is empty")]
    EmptyConflictSet(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// The database directory could not be created.
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
