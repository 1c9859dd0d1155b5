//! A database on the server: the owner of documents, bulk writes, and
//! change tracking.
//!
//! Databases hand out identity-cached [`Document`] objects, run bulk writes
//! through one `_bulk_docs` call with per-document outcomes, and own the
//! change subscription that turns the server's `_changes` feed into local
//! notifications.

use crate::cache::{CacheEntry, ResourceCache};
use crate::changes::{ChangeReceiver, ChangeTracker, TrackingState};
use crate::client::{ClientConfig, HttpRequest, Operation, RequestExecutor};
use crate::document::Document;
use crate::error::Result;
use crate::tracker::RevisionTracker;
use crate::types::{BulkDocResult, DatabaseInfo, SequenceNumber, WriteAck};
use http::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

/// One database, addressed by name relative to its server.
pub struct Database {
    name: String,
    url: Url,
    executor: Arc<dyn RequestExecutor>,
    tracker: Arc<RevisionTracker>,
    documents: ResourceCache<Document>,
    changes: Arc<ChangeTracker>,
}

impl Database {
    pub(crate) fn new(
        name: &str,
        server_url: &Url,
        executor: Arc<dyn RequestExecutor>,
        config: &ClientConfig,
    ) -> Result<Arc<Database>> {
        // Trailing slash so document ids join as children, not siblings.
        let url = server_url.join(&format!("{name}/"))?;
        let tracker = Arc::new(RevisionTracker::new());
        let changes = Arc::new(ChangeTracker::new(
            Arc::clone(&executor),
            url.clone(),
            Arc::clone(&tracker),
            config,
        ));
        Ok(Arc::new(Database {
            name: name.to_string(),
            url,
            executor,
            tracker,
            documents: ResourceCache::new(config.document_retain_limit),
            changes,
        }))
    }

    /// The database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The document object for `id`.
    ///
    /// Makes no server calls; the document does not need to exist yet.
    /// Identity-cached: within this database there is never more than one
    /// live instance per id.
    pub fn document(&self, id: &str) -> Result<Arc<Document>> {
        self.documents.try_get_or_insert(id, || {
            let url = self.url.join(id)?;
            Ok(Arc::new(Document::new(
                id,
                url,
                Arc::clone(&self.executor),
                Arc::clone(&self.tracker),
            )))
        })
    }

    /// Create the database on the server.
    ///
    /// Fails with HTTP 412 when a database with this name already exists.
    pub fn create(&self) -> Operation {
        Operation::issue(
            Arc::clone(&self.executor),
            HttpRequest::new(Method::PUT, self.url.clone()),
        )
    }

    /// Fetch the database metadata.
    pub async fn info(&self) -> Result<DatabaseInfo> {
        let request = HttpRequest::new(Method::GET, self.url.clone());
        Operation::issue(Arc::clone(&self.executor), request)
            .result()
            .await
    }

    /// The current total number of documents.
    pub async fn document_count(&self) -> Result<u64> {
        Ok(self.info().await?.doc_count)
    }

    /// Create a document with a server-assigned id.
    ///
    /// The acknowledged id and revision are recorded in the tracker on
    /// completion.
    pub fn post_document(&self, properties: Value) -> Operation {
        let request = match HttpRequest::new(Method::POST, self.url.clone()).with_json(&properties)
        {
            Ok(request) => request,
            Err(err) => return Operation::failed(Method::POST, self.url.path(), err),
        };
        let op = Operation::issue(Arc::clone(&self.executor), request);
        let tracker = Arc::clone(&self.tracker);
        op.on_complete(move |outcome| {
            if let Ok(response) = outcome {
                if let Ok(ack) = response.json::<WriteAck>() {
                    tracker.note_revision(&ack.id, &ack.rev, false);
                }
            }
        });
        op
    }

    /// Bulk-write multiple documents in one HTTP call.
    ///
    /// Each body with an `"_id"` updates (or creates) that document and
    /// must carry the `"_rev"` it is updating when the document exists; a
    /// body without `"_id"` creates a document with a server-assigned id.
    /// All named documents are busy (pinned) for the duration.
    ///
    /// The typed result is `Vec<BulkDocResult>`: one outcome per input, in
    /// input order. A conflict on one document never rolls back the others
    /// (each document's revision is advanced independently). Change-feed
    /// records arriving while the batch is in flight are deferred and
    /// flushed, in arrival order, when it completes.
    pub fn put_changes(&self, docs: Vec<Value>) -> Operation {
        let ids: Vec<String> = docs
            .iter()
            .filter_map(|doc| doc.get("_id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        for id in &ids {
            self.tracker.begin_write(id);
        }
        self.changes.begin_batch();

        let request = match HttpRequest::new(Method::POST, self.bulk_docs_url())
            .with_json(&json!({ "docs": docs }))
        {
            Ok(request) => request,
            Err(err) => {
                for id in &ids {
                    self.tracker.end_write(id, None);
                }
                self.changes.end_batch();
                return Operation::failed(Method::POST, self.url.path(), err);
            }
        };

        let op = Operation::issue(Arc::clone(&self.executor), request);
        let tracker = Arc::clone(&self.tracker);
        let changes = Arc::clone(&self.changes);
        op.on_complete(move |outcome| {
            match outcome {
                Ok(response) => match response.json::<Vec<BulkDocResult>>() {
                    Ok(results) => {
                        // Fan the single response array back out, one
                        // document at a time.
                        for result in &results {
                            tracker.end_write(&result.id, result.rev.as_ref());
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "unparseable bulk response");
                        for id in &ids {
                            tracker.end_write(id, None);
                        }
                    }
                },
                Err(_) => {
                    for id in &ids {
                        tracker.end_write(id, None);
                    }
                }
            }
            changes.end_batch();
        });
        op
    }

    /// Turn change tracking on.
    ///
    /// Off by default. Only external changes produce notifications: ones
    /// made through this database object are already known to the tracker
    /// and are suppressed.
    pub async fn enable_change_tracking(&self) -> Result<()> {
        self.changes.enable().await
    }

    /// Turn change tracking off and discard pending notifications.
    pub fn disable_change_tracking(&self) {
        self.changes.disable();
    }

    /// Whether change tracking is on.
    pub fn tracks_changes(&self) -> bool {
        self.changes.is_enabled()
    }

    /// Where the subscription is in its lifecycle.
    pub fn tracking_state(&self) -> TrackingState {
        self.changes.state()
    }

    /// Register a notification channel for accepted change records.
    pub fn subscribe(&self) -> ChangeReceiver {
        self.changes.subscribe()
    }

    /// The last change sequence number processed (fetched from the server
    /// if not known yet). Persist it and hand it back through
    /// [`set_last_sequence_number`](Self::set_last_sequence_number) on
    /// relaunch to resume tracking without replaying history.
    pub async fn last_sequence_number(&self) -> Result<SequenceNumber> {
        self.changes.last_sequence_number().await
    }

    /// Seed the change-feed resume position.
    pub fn set_last_sequence_number(&self, seq: SequenceNumber) {
        self.changes.set_last_sequence_number(seq);
    }

    /// Empty the document cache. API calls will instantiate and return new
    /// instances from now on; identity across this call is deliberately not
    /// preserved.
    pub fn clear_document_cache(&self) {
        self.documents.clear();
    }

    fn bulk_docs_url(&self) -> Url {
        // The database URL always ends with '/', so this join cannot fail.
        self.url
            .join("_bulk_docs")
            .unwrap_or_else(|_| self.url.clone())
    }
}

impl CacheEntry for Database {
    /// A database is pinned while it has work only it can finish: an
    /// enabled change subscription or a bulk batch in flight.
    fn is_pinned(&self) -> bool {
        self.changes.is_enabled() || self.changes.has_batch_in_flight()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // The feed task owns a handle to the change tracker; disabling here
        // tears it down when the last database handle goes away.
        self.changes.disable();
    }
}
