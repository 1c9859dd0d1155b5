//! Core wire types: revisions, sequence numbers, change records, and
//! bulk-write outcomes.
//!
//! Field names follow the CouchDB wire protocol: `"_id"`, `"_rev"`,
//! `"_deleted"` inside document bodies; `"seq"`, `"id"`, `"changes"` on the
//! feed; `"update_seq"` and `"doc_count"` in database metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position marker in the change feed. Monotonically non-decreasing as
/// delivered by the server; persistable across restarts to resume tracking.
pub type SequenceNumber = u64;

/// An opaque, server-assigned document revision.
///
/// Revisions have the shape `"N-hash"`. The numeric generation prefix orders
/// revisions of one document: each successful write advances it by one. The
/// hash part is opaque and never interpreted.
///
/// # Examples
///
/// ```
/// use davenport::RevisionId;
///
/// let rev = RevisionId::new("3-917fa2381192822767f010b95b45325b");
/// assert_eq!(rev.generation(), 3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Wrap a raw revision string.
    pub fn new(rev: impl Into<String>) -> Self {
        RevisionId(rev.into())
    }

    /// The raw revision string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric generation prefix, or 0 if the revision has no `N-` shape.
    ///
    /// Used to keep tracked revisions monotonic: a feed record carrying a
    /// lower generation than the tracked revision is stale and never
    /// overwrites it.
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(n, _)| n.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        RevisionId(s.to_string())
    }
}

impl From<String> for RevisionId {
    fn from(s: String) -> Self {
        RevisionId(s)
    }
}

/// One document mutation as reported by the change feed, and the payload of
/// a local change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseChange {
    /// Feed position of this record.
    pub seq: SequenceNumber,
    /// Identifier of the changed document.
    pub id: String,
    /// The document's revision after the change.
    pub rev: RevisionId,
    /// Whether the change deleted the document.
    pub deleted: bool,
}

/// Per-document outcome of a bulk write (`_bulk_docs`).
///
/// The server answers with one outcome per submitted document, in input
/// order. A conflict for one document does not roll back the others.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BulkDocResult {
    /// `true` when the server accepted the write.
    #[serde(default)]
    pub ok: bool,
    /// Identifier of the document (server-assigned for bodies without `_id`).
    pub id: String,
    /// The new revision, when the write was accepted.
    #[serde(default)]
    pub rev: Option<RevisionId>,
    /// Error class (`"conflict"` for a stale revision), when rejected.
    #[serde(default)]
    pub error: Option<String>,
    /// Human-readable rejection reason.
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkDocResult {
    /// Whether this document's revision check failed.
    pub fn is_conflict(&self) -> bool {
        self.error.as_deref() == Some("conflict")
    }
}

/// Database metadata (`GET /<db>`).
#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseInfo {
    /// Name of the database.
    #[serde(default)]
    pub db_name: String,
    /// Current total number of documents.
    #[serde(default)]
    pub doc_count: u64,
    /// Current position of the change feed.
    #[serde(default)]
    pub update_seq: SequenceNumber,
}

/// Server metadata (`GET /`).
#[derive(Clone, Debug, Deserialize)]
pub struct ServerInfo {
    /// Server version string.
    pub version: String,
}

/// Response of `GET /_uuids`.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct UuidsResponse {
    pub uuids: Vec<String>,
}

/// Acknowledgement of a single-document write.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WriteAck {
    #[serde(default)]
    #[allow(dead_code)]
    pub ok: bool,
    pub id: String,
    pub rev: RevisionId,
}
