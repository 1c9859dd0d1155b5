#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Davenport: a CouchDB client that remembers
//!
//! This crate is a client-side access layer for a document-oriented
//! database exposed over HTTP (the CouchDB wire protocol). Three things
//! distinguish it from a plain request wrapper:
//!
//! 1. **Identity-cached resources** - servers hand out databases, databases
//!    hand out documents, and within one parent there is never more than
//!    one live object per path. The cache deduplicates construction without
//!    owning the objects.
//! 2. **Revision tracking** - every write and fetch feeds a per-database
//!    tracker of current revisions and in-flight writes, driving optimistic
//!    concurrency (`_rev` filling, 409 classification) and cache pinning.
//! 3. **Change tracking** - a long-lived subscription to the `_changes`
//!    feed, reconciled against the tracker so your own writes do not echo
//!    back as notifications, delivered strictly in feed order, resumable by
//!    sequence number across reconnects and restarts.
//!
//! ## Quick tour
//!
//! ```ignore
//! use davenport::Server;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> davenport::Result<()> {
//!     let server = Server::new("http://localhost:5984")?;
//!     let db = server.database("mail")?;
//!
//!     // Writes go through operations: await them, or attach callbacks.
//!     let doc = db.document("welcome")?;
//!     let op = doc.save(serde_json::json!({"subject": "hello"})).await;
//!     op.wait().await?;
//!
//!     // External changes arrive as ordered notifications.
//!     let mut changes = db.subscribe();
//!     db.enable_change_tracking().await?;
//!     while let Some(change) = changes.next().await {
//!         println!("{} is now at {}", change.id, change.rev);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module structure
//!
//! - **[client]** - the request-executor seam, the operation model, and
//!   configuration
//! - **[cache]** - the identity-preserving resource cache
//! - **[tracker]** - per-document revision and busy-state bookkeeping
//! - **[changes]** - the change-feed decoder and subscription state machine
//! - **[error]** - error taxonomy
//! - **[types]** - revisions, sequence numbers, change records, bulk
//!   outcomes
//!
//! The resource objects ([`Server`], [`Database`], [`Document`]) tie these
//! together and are what most callers touch.

pub mod cache;
pub mod changes;
pub mod client;
mod database;
mod document;
pub mod error;
mod server;
pub mod tracker;
pub mod types;

pub use cache::{CacheEntry, ResourceCache};
pub use changes::{ChangeReceiver, ChangeStream, FeedDecoder, FeedEvent, TrackingState};
pub use client::{
    ByteStream, ClientConfig, HttpExecutor, HttpRequest, HttpResponse, Operation, RequestExecutor,
};
pub use database::Database;
pub use document::Document;
pub use error::{Error, Result};
pub use server::Server;
pub use tracker::RevisionTracker;
pub use types::{
    BulkDocResult, DatabaseChange, DatabaseInfo, RevisionId, SequenceNumber, ServerInfo,
};
