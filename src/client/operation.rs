//! Asynchronous operations over single HTTP requests.
//!
//! An [`Operation`] wraps one request executor invocation behind a
//! write-once completion cell. The request starts the moment the operation
//! is issued; the handle then supports two symmetric access styles off the
//! same underlying state:
//!
//! - **await** - [`Operation::wait`] parks the calling task until the
//!   outcome is settled, and returns it. Waiting on a completed operation
//!   returns immediately with the stored outcome; the request is never
//!   re-issued.
//! - **callback** - [`Operation::on_complete`] registers a closure that runs
//!   exactly once, with the same outcome value a waiter sees.
//!
//! Completion ordering is strict: the outcome is fully settled and every
//! registered callback has run before any waiter is released.
//!
//! # Examples
//!
//! ```ignore
//! let op = database.put_changes(docs);
//! let results: Vec<BulkDocResult> = op.result().await?;
//! ```

use crate::client::executor::{HttpRequest, HttpResponse, RequestExecutor};
use crate::error::Result;
use http::Method;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

type Outcome = Result<HttpResponse>;
type Callback = Box<dyn FnOnce(&Outcome) + Send>;

enum Cell {
    /// Request in flight.
    Pending { callbacks: Vec<Callback> },
    /// Outcome decided, first callback batch running. Late registrations
    /// land here and are drained before the cell settles.
    Completing { callbacks: Vec<Callback> },
    /// Immutable from here on.
    Complete(Outcome),
}

struct Shared {
    cell: Mutex<Cell>,
    done: Notify,
}

impl Shared {
    fn new() -> Self {
        Shared {
            cell: Mutex::new(Cell::Pending {
                callbacks: Vec::new(),
            }),
            done: Notify::new(),
        }
    }

    fn peek(&self) -> Option<Outcome> {
        match &*self.cell.lock() {
            Cell::Complete(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Settle the cell. Runs callbacks (including ones registered while the
    /// batch is running), stores the outcome, then releases waiters.
    fn complete(&self, outcome: Outcome) {
        let mut batch = {
            let mut cell = self.cell.lock();
            match std::mem::replace(
                &mut *cell,
                Cell::Completing {
                    callbacks: Vec::new(),
                },
            ) {
                Cell::Pending { callbacks } => callbacks,
                other => {
                    // Transitions to complete exactly once.
                    *cell = other;
                    debug_assert!(false, "operation completed twice");
                    return;
                }
            }
        };
        loop {
            for callback in batch.drain(..) {
                callback(&outcome);
            }
            let mut cell = self.cell.lock();
            match &mut *cell {
                Cell::Completing { callbacks } if !callbacks.is_empty() => {
                    batch = std::mem::take(callbacks);
                }
                _ => {
                    *cell = Cell::Complete(outcome);
                    break;
                }
            }
        }
        self.done.notify_waiters();
    }
}

/// Handle to one outstanding or completed request.
///
/// Cloning the handle is cheap and shares the same completion cell; all
/// clones observe the identical outcome.
#[derive(Clone)]
pub struct Operation {
    method: Method,
    path: String,
    shared: Arc<Shared>,
}

impl Operation {
    /// Start a request immediately and return its handle.
    ///
    /// Never blocks the issuer: the request runs on a spawned task. Must be
    /// called from within a Tokio runtime.
    pub(crate) fn issue(executor: Arc<dyn RequestExecutor>, request: HttpRequest) -> Operation {
        let shared = Arc::new(Shared::new());
        let op = Operation {
            method: request.method.clone(),
            path: request.url.path().to_string(),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(async move {
            let outcome = match executor.execute(request).await {
                Ok(response) => response.into_result(),
                Err(err) => Err(err),
            };
            if let Err(err) = &outcome {
                tracing::debug!(error = %err, "operation completed with error");
            }
            shared.complete(outcome);
        });
        op
    }

    /// An operation that was dead on arrival (e.g. its request could not be
    /// encoded). Already complete; waiters and callbacks observe `error`.
    pub(crate) fn failed(method: Method, path: impl Into<String>, error: crate::Error) -> Operation {
        let shared = Arc::new(Shared::new());
        shared.complete(Err(error));
        Operation {
            method,
            path: path.into(),
            shared,
        }
    }

    #[cfg(test)]
    fn pending_for_test() -> (Operation, Arc<Shared>) {
        let shared = Arc::new(Shared::new());
        let op = Operation {
            method: Method::GET,
            path: "/test".to_string(),
            shared: Arc::clone(&shared),
        };
        (op, shared)
    }

    #[cfg(test)]
    fn complete_for_test(shared: &Shared, outcome: Outcome) {
        shared.complete(outcome);
    }

    /// Park the calling task until completion and return the outcome.
    ///
    /// Idempotent: on a completed operation this returns immediately with
    /// the stored result, identical on every call.
    pub async fn wait(&self) -> Result<HttpResponse> {
        loop {
            let notified = self.shared.done.notified();
            if let Some(outcome) = self.shared.peek() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Wait for completion and decode the response body.
    pub async fn result<T: DeserializeOwned>(&self) -> Result<T> {
        self.wait().await?.json()
    }

    /// Register a completion callback.
    ///
    /// Runs exactly once, after the outcome is settled and before any waiter
    /// is released. Registering on an already-complete operation runs the
    /// callback immediately with the stored outcome.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<HttpResponse>) + Send + 'static,
    {
        let immediate = {
            let mut cell = self.shared.cell.lock();
            match &mut *cell {
                Cell::Pending { callbacks } | Cell::Completing { callbacks } => {
                    callbacks.push(Box::new(callback));
                    None
                }
                // Run outside the lock: a callback is allowed to touch the
                // operation it was registered on.
                Cell::Complete(outcome) => Some((Box::new(callback) as Callback, outcome.clone())),
            }
        };
        if let Some((callback, outcome)) = immediate {
            callback(&outcome);
        }
    }

    /// Whether the operation has settled.
    pub fn is_complete(&self) -> bool {
        matches!(&*self.shared.cell.lock(), Cell::Complete(_))
    }

    /// The settled outcome, without waiting. `None` while in flight.
    pub fn try_outcome(&self) -> Option<Result<HttpResponse>> {
        self.shared.peek()
    }

    /// HTTP method of the underlying request.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// URL path of the underlying request.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("complete", &self.is_complete())
            .finish()
    }
}
