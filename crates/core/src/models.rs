//! Domain model types used throughout outline-sync.
//!
//! These types bridge the outline editor's in-memory node map, the persisted
//! row format of the document store, and the events flowing between them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// In-memory node map, keyed by node id.
pub type NodeMap = BTreeMap<String, Node>;

/// One outline node as the editor sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Text blob of the card.
    pub content: String,
    /// Ordered child node ids.
    #[serde(default)]
    pub children: Vec<String>,
    /// Revision marker of the stored copy this node was read from, if any.
    #[serde(default)]
    pub rev: Option<String>,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
}

impl Node {
    /// Create a new, never-stored node.
    pub fn new(content: impl Into<String>, children: Vec<String>) -> Self {
        Self {
            content: content.into(),
            children,
            rev: None,
            deleted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

/// A row as persisted in the document store.
///
/// The serialized field names are fixed: `id`, `revisionMarker`, `content`,
/// `children`, `deletedFlag`. Unknown fields are rejected on decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Row {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_marker: Option<String>,
    pub content: String,
    pub children: Vec<String>,
    #[serde(default)]
    pub deleted_flag: bool,
}

impl Row {
    /// A tombstone row retiring revision `rev` of node `id`.
    pub fn tombstone(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision_marker: Some(rev.into()),
            content: String::new(),
            children: Vec::new(),
            deleted_flag: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// One physical copy of a node as stored, carrying its own marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    pub id: String,
    pub rev: String,
    pub content: String,
    pub children: Vec<String>,
    pub deleted: bool,
}

impl Revision {
    /// Whether two revisions carry the same content and children.
    pub fn same_payload(&self, other: &Revision) -> bool {
        self.content == other.content && self.children == other.children
    }

    /// The generation prefix of the marker (`3` for `3-abcd`), or 0 if the
    /// marker has no numeric prefix.
    pub fn generation(&self) -> u64 {
        marker_generation(&self.rev)
    }

    /// Rewrite this revision as an upsert row.
    pub fn to_row(&self) -> Row {
        Row {
            id: self.id.clone(),
            revision_marker: Some(self.rev.clone()),
            content: self.content.clone(),
            children: self.children.clone(),
            deleted_flag: self.deleted,
        }
    }
}

/// Parse the generation prefix of a revision marker.
pub fn marker_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Change feed & write batches
// ---------------------------------------------------------------------------

/// One entry of the store's change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    /// Monotonic sequence number within the emitting store.
    pub seq: u64,
    pub deleted: bool,
    /// The store's current winning document for `id`.
    pub doc: Option<serde_json::Value>,
    /// Markers of other live revisions competing with `doc`.
    #[serde(default)]
    pub competing: Vec<String>,
}

impl ChangeEvent {
    pub fn is_conflicted(&self) -> bool {
        !self.competing.is_empty()
    }
}

/// Ordered row mutations submitted to the store in one call.
pub type WriteBatch = Vec<Row>;

/// Per-row outcome of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWriteResult {
    pub id: String,
    /// The new revision marker, or the reason the row was rejected.
    pub outcome: Result<String, String>,
}

impl RowWriteResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Downstream events
// ---------------------------------------------------------------------------

/// Events forwarded to the outline editor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Changed { id: String, fields: Node },
    Deleted { id: String },
    /// A conflict set could not be merged; the user must be told.
    ResolutionFailed { id: String, reason: String },
}

impl NodeEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Changed { id, .. } | Self::Deleted { id } | Self::ResolutionFailed { id, .. } => {
                id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_field_names() {
        let row = Row {
            id: "n1".into(),
            revision_marker: Some("1-abc".into()),
            content: "hello".into(),
            children: vec!["n2".into()],
            deleted_flag: false,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "n1",
                "revisionMarker": "1-abc",
                "content": "hello",
                "children": ["n2"],
                "deletedFlag": false,
            })
        );
    }

    #[test]
    fn test_unstored_row_omits_marker() {
        let row = Row {
            id: "n1".into(),
            revision_marker: None,
            content: String::new(),
            children: vec![],
            deleted_flag: false,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("revisionMarker").is_none());
    }

    #[test]
    fn test_marker_generation() {
        assert_eq!(marker_generation("12-ff00"), 12);
        assert_eq!(marker_generation("garbage"), 0);
        assert_eq!(marker_generation("x-1"), 0);
    }

    #[test]
    fn test_tombstone_row() {
        let row = Row::tombstone("n1", "2-aa");
        assert!(row.deleted_flag);
        assert_eq!(row.revision_marker.as_deref(), Some("2-aa"));
    }
}
