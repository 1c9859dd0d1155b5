//! Per-database revision and busy-state bookkeeping.
//!
//! The tracker records, for every document the client has touched, the
//! current known revision, whether the last known state is a deletion, and
//! how many writes are in flight. It answers two questions the rest of the
//! crate keeps asking:
//!
//! - *Is this document busy?* An in-flight write pins the document's cache
//!   entry so the identity object cannot be evicted out from under the
//!   write's completion.
//! - *Is this feed record news?* A change record whose revision the tracker
//!   already holds is a self-inflicted change (observed through the write's
//!   own completion) and is suppressed; a record whose generation is lower
//!   than the tracked one is a stale replay and is suppressed too. Stored
//!   revisions never regress.
//!
//! Every check-and-update sequence runs under one mutex.

use crate::types::{DatabaseChange, RevisionId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct DocState {
    revision: Option<RevisionId>,
    deleted: bool,
    busy: u32,
}

/// Shared revision/busy state for one database.
#[derive(Default)]
pub struct RevisionTracker {
    inner: Mutex<HashMap<String, DocState>>,
}

impl RevisionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a write for `id` is in flight. Pins the cache entry.
    pub fn begin_write(&self, id: &str) {
        let mut map = self.inner.lock();
        map.entry(id.to_string()).or_default().busy += 1;
    }

    /// Record the end of a write.
    ///
    /// `acknowledged` carries the server-assigned revision on success, or
    /// `None` on failure (transport error, conflict); either way the busy
    /// count drops. The stored revision only advances, never regresses.
    pub fn end_write(&self, id: &str, acknowledged: Option<&RevisionId>) {
        self.finish_write(id, acknowledged, false);
    }

    /// Like [`end_write`](Self::end_write) for a deletion: the acknowledged
    /// revision is the tombstone and the document is marked deleted.
    pub fn end_write_deleted(&self, id: &str, tombstone: Option<&RevisionId>) {
        self.finish_write(id, tombstone, true);
    }

    fn finish_write(&self, id: &str, acknowledged: Option<&RevisionId>, deleted: bool) {
        let mut map = self.inner.lock();
        let state = map.entry(id.to_string()).or_default();
        state.busy = state.busy.saturating_sub(1);
        if let Some(rev) = acknowledged {
            if Self::advances(state.revision.as_ref(), rev) {
                state.revision = Some(rev.clone());
                state.deleted = deleted;
            }
        }
    }

    /// Record a revision learned outside the write path: an authoritative
    /// fetch, or a creation with a server-assigned id.
    pub fn note_revision(&self, id: &str, rev: &RevisionId, deleted: bool) {
        let mut map = self.inner.lock();
        let state = map.entry(id.to_string()).or_default();
        if Self::advances(state.revision.as_ref(), rev) {
            state.revision = Some(rev.clone());
            state.deleted = deleted;
        }
    }

    /// The current known revision of `id`, if any.
    pub fn current_revision(&self, id: &str) -> Option<RevisionId> {
        self.inner.lock().get(id).and_then(|s| s.revision.clone())
    }

    /// Whether a write for `id` is in flight.
    pub fn is_busy(&self, id: &str) -> bool {
        self.inner.lock().get(id).map_or(false, |s| s.busy > 0)
    }

    /// Whether the last known state of `id` is a deletion.
    pub fn is_deleted(&self, id: &str) -> bool {
        self.inner.lock().get(id).map_or(false, |s| s.deleted)
    }

    /// Reconcile a feed record against local knowledge.
    ///
    /// Returns `true` when the record is news worth notifying about, in
    /// which case the stored revision has been advanced to the record's.
    /// Returns `false` to suppress:
    ///
    /// - the record's revision equals the tracked one (a change this client
    ///   made itself, or a redelivery after reconnect), or
    /// - the record's generation is lower than the tracked one (stale
    ///   replay; the stored revision must not regress).
    pub fn apply_change(&self, change: &DatabaseChange) -> bool {
        let mut map = self.inner.lock();
        let state = map.entry(change.id.clone()).or_default();
        match state.revision.as_ref() {
            Some(current) if *current == change.rev => false,
            Some(current) if change.rev.generation() < current.generation() => {
                tracing::trace!(id = %change.id, rev = %change.rev, "stale feed record suppressed");
                false
            }
            _ => {
                state.revision = Some(change.rev.clone());
                state.deleted = change.deleted;
                true
            }
        }
    }

    fn advances(current: Option<&RevisionId>, candidate: &RevisionId) -> bool {
        match current {
            Some(current) => candidate.generation() >= current.generation(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(seq: u64, id: &str, rev: &str) -> DatabaseChange {
        DatabaseChange {
            seq,
            id: id.to_string(),
            rev: RevisionId::new(rev),
            deleted: false,
        }
    }

    #[test]
    fn busy_count_pairs_up() {
        let tracker = RevisionTracker::new();
        tracker.begin_write("a");
        tracker.begin_write("a");
        assert!(tracker.is_busy("a"));
        tracker.end_write("a", Some(&RevisionId::new("1-x")));
        assert!(tracker.is_busy("a"));
        tracker.end_write("a", Some(&RevisionId::new("2-y")));
        assert!(!tracker.is_busy("a"));
    }

    #[test]
    fn failed_write_drops_busy_without_advancing() {
        let tracker = RevisionTracker::new();
        tracker.note_revision("a", &RevisionId::new("3-c"), false);
        tracker.begin_write("a");
        tracker.end_write("a", None);
        assert!(!tracker.is_busy("a"));
        assert_eq!(tracker.current_revision("a"), Some(RevisionId::new("3-c")));
    }

    #[test]
    fn self_inflicted_change_is_suppressed() {
        let tracker = RevisionTracker::new();
        tracker.begin_write("a");
        tracker.end_write("a", Some(&RevisionId::new("2-b")));
        assert!(!tracker.apply_change(&change(10, "a", "2-b")));
    }

    #[test]
    fn redelivery_is_idempotent() {
        let tracker = RevisionTracker::new();
        let record = change(7, "a", "4-d");
        assert!(tracker.apply_change(&record));
        assert!(!tracker.apply_change(&record));
    }

    #[test]
    fn stale_record_never_regresses_revision() {
        let tracker = RevisionTracker::new();
        tracker.begin_write("a");
        tracker.end_write("a", Some(&RevisionId::new("2-b")));
        assert!(!tracker.apply_change(&change(5, "a", "1-a")));
        assert_eq!(tracker.current_revision("a"), Some(RevisionId::new("2-b")));
    }

    #[test]
    fn external_change_advances_and_notifies() {
        let tracker = RevisionTracker::new();
        tracker.note_revision("a", &RevisionId::new("1-a"), false);
        let record = change(9, "a", "2-remote");
        assert!(tracker.apply_change(&record));
        assert_eq!(
            tracker.current_revision("a"),
            Some(RevisionId::new("2-remote"))
        );
    }

    #[test]
    fn deleted_change_marks_tombstone() {
        let tracker = RevisionTracker::new();
        let mut record = change(3, "a", "2-t");
        record.deleted = true;
        assert!(tracker.apply_change(&record));
        assert!(tracker.is_deleted("a"));
    }

    #[test]
    fn unknown_document_is_not_busy() {
        let tracker = RevisionTracker::new();
        assert!(!tracker.is_busy("ghost"));
        assert_eq!(tracker.current_revision("ghost"), None);
    }
}
