//! A single document within a database.
//!
//! `Document` objects are identity-cached by their database: there is never
//! more than one live instance per document id. Creating one makes no
//! server calls; the document does not even need to exist yet.
//!
//! Writes flow through the revision tracker: `save` and `delete` mark the
//! document busy for their duration (pinning it in the cache), fill in the
//! revision being updated, and record the acknowledged revision on
//! completion. Writes issued in program order are serialized per document,
//! so a later write never names a revision an earlier in-flight write is
//! about to replace.

use crate::cache::CacheEntry;
use crate::client::{HttpRequest, Operation, RequestExecutor};
use crate::error::Error;
use crate::tracker::RevisionTracker;
use crate::types::{RevisionId, WriteAck};
use http::Method;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// One document, addressed by id relative to its database.
pub struct Document {
    id: String,
    url: Url,
    executor: Arc<dyn RequestExecutor>,
    tracker: Arc<RevisionTracker>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Document {
    pub(crate) fn new(
        id: &str,
        url: Url,
        executor: Arc<dyn RequestExecutor>,
        tracker: Arc<RevisionTracker>,
    ) -> Self {
        Document {
            id: id.to_string(),
            url,
            executor,
            tracker,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The document id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current locally known revision, if any.
    pub fn current_revision(&self) -> Option<RevisionId> {
        self.tracker.current_revision(&self.id)
    }

    /// Whether the last known state of this document is a deletion.
    pub fn is_deleted(&self) -> bool {
        self.tracker.is_deleted(&self.id)
    }

    /// Whether a write is in flight.
    pub fn is_busy(&self) -> bool {
        self.tracker.is_busy(&self.id)
    }

    /// Fetch the document body and record its revision.
    pub async fn get(&self) -> crate::Result<Value> {
        let request = HttpRequest::new(Method::GET, self.url.clone());
        let response = Operation::issue(Arc::clone(&self.executor), request)
            .wait()
            .await?;
        let body: Value = response.json()?;
        if let Some(rev) = body.get("_rev").and_then(Value::as_str) {
            let deleted = body
                .get("_deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            self.tracker
                .note_revision(&self.id, &RevisionId::new(rev), deleted);
        }
        Ok(body)
    }

    /// Write `properties` as the document's new body.
    ///
    /// If the body carries no `"_rev"`, the current tracked revision is
    /// filled in. The returned operation completes with the server's
    /// acknowledgement; a stale revision surfaces as
    /// [`Error::RevisionConflict`]. The document stays busy (and pinned in
    /// the cache) until completion.
    pub async fn save(&self, mut properties: Value) -> Operation {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let Some(body) = properties.as_object_mut() else {
            return Operation::failed(
                Method::PUT,
                self.url.path(),
                Error::Decode("document body must be a JSON object".into()),
            );
        };
        if !body.contains_key("_rev") {
            if let Some(rev) = self.tracker.current_revision(&self.id) {
                body.insert("_rev".to_string(), Value::String(rev.as_str().to_string()));
            }
        }

        self.tracker.begin_write(&self.id);
        let request = match HttpRequest::new(Method::PUT, self.url.clone()).with_json(&properties)
        {
            Ok(request) => request,
            Err(err) => {
                self.tracker.end_write(&self.id, None);
                return Operation::failed(Method::PUT, self.url.path(), err);
            }
        };

        let op = Operation::issue(Arc::clone(&self.executor), request);
        let tracker = Arc::clone(&self.tracker);
        let id = self.id.clone();
        op.on_complete(move |outcome| {
            // Holds the per-document write lock until the write settles.
            let _serialized = guard;
            match outcome {
                Ok(response) => match response.json::<WriteAck>() {
                    Ok(ack) => tracker.end_write(&id, Some(&ack.rev)),
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "unparseable write acknowledgement");
                        tracker.end_write(&id, None);
                    }
                },
                Err(_) => tracker.end_write(&id, None),
            }
        });
        op
    }

    /// Delete the document at its current tracked revision.
    ///
    /// With no known revision there is nothing to name in the `rev` query
    /// parameter; the operation fails immediately with
    /// [`Error::RevisionConflict`]. Fetch first, then delete.
    pub async fn delete(&self) -> Operation {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let Some(rev) = self.tracker.current_revision(&self.id) else {
            return Operation::failed(Method::DELETE, self.url.path(), Error::RevisionConflict);
        };

        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("rev", rev.as_str());
        self.tracker.begin_write(&self.id);

        let op = Operation::issue(Arc::clone(&self.executor), HttpRequest::new(Method::DELETE, url));
        let tracker = Arc::clone(&self.tracker);
        let id = self.id.clone();
        op.on_complete(move |outcome| {
            let _serialized = guard;
            match outcome {
                Ok(response) => match response.json::<WriteAck>() {
                    Ok(ack) => tracker.end_write_deleted(&id, Some(&ack.rev)),
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "unparseable delete acknowledgement");
                        tracker.end_write(&id, None);
                    }
                },
                Err(_) => tracker.end_write(&id, None),
            }
        });
        op
    }
}

impl CacheEntry for Document {
    fn is_pinned(&self) -> bool {
        self.tracker.is_busy(&self.id)
    }
}
