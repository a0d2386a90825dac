//! Mapping between the in-memory node map and persisted rows.
//!
//! Rows arrive from the store as raw JSON documents. Decoding names every
//! field explicitly and rejects anything unexpected; a bad row is reported
//! as a [`DecodeError`] carrying its id and never stops the remaining rows
//! from decoding.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::DecodeError;
use crate::models::{Node, NodeMap, Revision, Row};

/// Placeholder id used when a row's id itself cannot be read.
pub const UNKNOWN_ID: &str = "<unknown>";

/// Result of decoding a snapshot: every good row, plus one error per bad row.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub nodes: NodeMap,
    pub errors: Vec<DecodeError>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Emit one row per node in the map.
pub fn to_rows(nodes: &NodeMap) -> Vec<Row> {
    nodes
        .iter()
        .map(|(id, node)| Row {
            id: id.clone(),
            revision_marker: node.rev.clone(),
            content: node.content.clone(),
            children: node.children.clone(),
            deleted_flag: node.deleted,
        })
        .collect()
}

/// Decode raw store documents into a node map.
pub fn from_rows<'a, I>(docs: I) -> Decoded
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut decoded = Decoded::default();
    for doc in docs {
        match decode_row(doc) {
            Ok(row) => {
                let node = normalize(&row);
                decoded.nodes.insert(row.id, node);
            }
            Err(e) => {
                warn!(id = %e.id, detail = %e.detail, "skipping malformed row");
                decoded.errors.push(e);
            }
        }
    }
    debug!(
        nodes = decoded.nodes.len(),
        errors = decoded.errors.len(),
        "decoded rows"
    );
    decoded
}

/// Decode a single raw document into a typed [`Row`].
pub fn decode_row(doc: &Value) -> Result<Row, DecodeError> {
    let id = match doc.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        Some(_) => {
            return Err(DecodeError {
                id: UNKNOWN_ID.into(),
                detail: "empty id".into(),
            })
        }
        None => {
            return Err(DecodeError {
                id: UNKNOWN_ID.into(),
                detail: "missing or non-string id".into(),
            })
        }
    };

    serde_json::from_value::<Row>(doc.clone()).map_err(|e| DecodeError {
        id,
        detail: e.to_string(),
    })
}

/// Decode a raw document that must carry a revision marker.
pub fn decode_revision(doc: &Value) -> Result<Revision, DecodeError> {
    let row = decode_row(doc)?;
    let rev = row.revision_marker.ok_or_else(|| DecodeError {
        id: row.id.clone(),
        detail: "missing revisionMarker".into(),
    })?;
    Ok(Revision {
        id: row.id,
        rev,
        content: row.content,
        children: row.children,
        deleted: row.deleted_flag,
    })
}

/// Encode a row as the raw document the store persists.
pub fn encode_row(row: &Row) -> Value {
    let mut doc = json!({
        "id": row.id,
        "content": row.content,
        "children": row.children,
        "deletedFlag": row.deleted_flag,
    });
    if let (Some(rev), Some(map)) = (&row.revision_marker, doc.as_object_mut()) {
        map.insert("revisionMarker".into(), Value::String(rev.clone()));
    }
    doc
}

/// Drop the row's identity and expose the node-model fields.
pub fn normalize(row: &Row) -> Node {
    Node {
        content: row.content.clone(),
        children: row.children.clone(),
        rev: row.revision_marker.clone(),
        deleted: row.deleted_flag,
    }
}
