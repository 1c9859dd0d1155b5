//! Change tracking: a long-lived subscription to the server's change feed,
//! reconciled against locally known revisions and delivered as ordered
//! notifications.
//!
//! ```text
//! changes/
//! ├── feed - incremental decoder for the continuous feed
//! └── mod  - subscription state machine and notification fan-out
//! ```
//!
//! # State machine
//!
//! ```text
//! Disabled ──enable()──▶ Connecting ──feed open──▶ Streaming
//!     ▲                                               │
//!     │                                         transport drop
//!  disable()                                          ▼
//!     └────────────────────────────────────────  Reconnecting
//!                                                (backoff, resume since
//!                                                 last processed seq)
//! ```
//!
//! Enabling with an unknown `lastSequenceNumber` first fetches the database
//! metadata to learn the current sequence, so turning tracking on does not
//! retroactively deliver the entire history. Reconnection resumes just
//! after the last processed sequence; redelivered records are made
//! harmless by the tracker's suppression check.
//!
//! # Delivery rules
//!
//! - A record whose revision the tracker already holds is suppressed
//!   (self-inflicted change, or a replay).
//! - Notification order equals feed arrival order, always.
//! - While a bulk batch is in flight the database is busy: surviving
//!   records are deferred and flushed in arrival order when the batch
//!   completes.
//! - Disabling tears the feed down and discards the deferred queue.
//! - A malformed record is logged and skipped; the feed stays alive.

mod feed;

pub use feed::{FeedDecoder, FeedEvent};

use crate::client::{ClientConfig, HttpRequest, RequestExecutor};
use crate::error::Result;
use crate::tracker::RevisionTracker;
use crate::types::{DatabaseChange, DatabaseInfo, SequenceNumber};
use futures::{Stream, StreamExt};
use http::Method;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// Where the subscription currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// Not tracking. Initial state, and terminal after `disable` until
    /// re-enabled.
    Disabled,
    /// Learning the starting sequence / opening the feed.
    Connecting,
    /// Feed open, records flowing.
    Streaming,
    /// Transport dropped; waiting out the backoff before resuming.
    Reconnecting,
}

/// Receives change notifications for one database.
///
/// Returned by [`ChangeTracker::subscribe`]. Dropping the receiver
/// unsubscribes: the sender is pruned on the next delivery attempt.
pub struct ChangeReceiver {
    receiver: mpsc::UnboundedReceiver<DatabaseChange>,
}

impl ChangeReceiver {
    /// Receive the next notification. `None` once the subscription is torn
    /// down and the queue is drained.
    pub async fn recv(&mut self) -> Option<DatabaseChange> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<DatabaseChange> {
        self.receiver.try_recv().ok()
    }

    /// Convert into a [`ChangeStream`] for use with `StreamExt`
    /// combinators that want an owned stream.
    pub fn into_stream(self) -> ChangeStream {
        ChangeStream {
            receiver: UnboundedReceiverStream::new(self.receiver),
        }
    }
}

impl Stream for ChangeReceiver {
    type Item = DatabaseChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// A change-notification stream wrapping the receiver channel.
pub struct ChangeStream {
    receiver: UnboundedReceiverStream<DatabaseChange>,
}

impl Stream for ChangeStream {
    type Item = DatabaseChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

struct DeliveryState {
    deferred: VecDeque<DatabaseChange>,
    batches: usize,
}

/// Per-database change subscription.
pub struct ChangeTracker {
    db_url: Url,
    executor: Arc<dyn RequestExecutor>,
    tracker: Arc<RevisionTracker>,
    state: Mutex<TrackingState>,
    last_seq: Mutex<Option<SequenceNumber>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DatabaseChange>>>,
    delivery: Mutex<DeliveryState>,
    task: Mutex<Option<JoinHandle<()>>>,
    backoff_ms: u64,
    max_backoff_ms: u64,
    heartbeat_ms: u64,
}

impl ChangeTracker {
    pub(crate) fn new(
        executor: Arc<dyn RequestExecutor>,
        db_url: Url,
        tracker: Arc<RevisionTracker>,
        config: &ClientConfig,
    ) -> Self {
        ChangeTracker {
            db_url,
            executor,
            tracker,
            state: Mutex::new(TrackingState::Disabled),
            last_seq: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            delivery: Mutex::new(DeliveryState {
                deferred: VecDeque::new(),
                batches: 0,
            }),
            task: Mutex::new(None),
            backoff_ms: config.feed_backoff_ms,
            max_backoff_ms: config.feed_max_backoff_ms,
            heartbeat_ms: config.feed_heartbeat_ms,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackingState {
        *self.state.lock()
    }

    /// Whether tracking is on (any state but `Disabled`).
    pub fn is_enabled(&self) -> bool {
        self.state() != TrackingState::Disabled
    }

    /// Register a notification channel.
    pub fn subscribe(&self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        ChangeReceiver { receiver: rx }
    }

    /// Turn tracking on.
    ///
    /// When the starting sequence is unknown this first awaits a metadata
    /// fetch (blocking only the enabling task) so history before "now" is
    /// never delivered. Idempotent while already enabled.
    pub async fn enable(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TrackingState::Disabled {
                return Ok(());
            }
            *state = TrackingState::Connecting;
        }

        if self.last_seq.lock().is_none() {
            match self.fetch_update_seq().await {
                Ok(seq) => {
                    let mut last = self.last_seq.lock();
                    if last.is_none() {
                        *last = Some(seq);
                    }
                }
                Err(err) => {
                    *self.state.lock() = TrackingState::Disabled;
                    return Err(err);
                }
            }
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_feed().await });
        *self.task.lock() = Some(handle);
        tracing::debug!(db = %self.db_url, "change tracking enabled");
        Ok(())
    }

    /// Turn tracking off and discard any deferred records.
    ///
    /// Best-effort cancellation: a record buffered by an in-flight read is
    /// discarded by the state check rather than delivered.
    pub fn disable(&self) {
        {
            let mut state = self.state.lock();
            if *state == TrackingState::Disabled {
                return;
            }
            *state = TrackingState::Disabled;
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.delivery.lock().deferred.clear();
        tracing::debug!(db = %self.db_url, "change tracking disabled");
    }

    /// The last sequence number this client has processed, fetching the
    /// server's current sequence if none is known yet.
    ///
    /// Persistable across restarts: hand it back through
    /// [`set_last_sequence_number`](Self::set_last_sequence_number) before
    /// enabling to resume without replaying history already seen.
    pub async fn last_sequence_number(&self) -> Result<SequenceNumber> {
        if let Some(seq) = *self.last_seq.lock() {
            return Ok(seq);
        }
        let seq = self.fetch_update_seq().await?;
        let mut last = self.last_seq.lock();
        Ok(*last.get_or_insert(seq))
    }

    /// Seed the resume position (typically a value persisted by the caller).
    pub fn set_last_sequence_number(&self, seq: SequenceNumber) {
        *self.last_seq.lock() = Some(seq);
    }

    /// A bulk batch started; surviving feed records are deferred until it
    /// ends.
    pub(crate) fn begin_batch(&self) {
        self.delivery.lock().batches += 1;
    }

    /// A bulk batch ended; flush deferred records in arrival order.
    pub(crate) fn end_batch(&self) {
        let mut delivery = self.delivery.lock();
        delivery.batches = delivery.batches.saturating_sub(1);
        if delivery.batches == 0 {
            let deferred: Vec<_> = delivery.deferred.drain(..).collect();
            for change in &deferred {
                self.fan_out(change);
            }
        }
    }

    pub(crate) fn has_batch_in_flight(&self) -> bool {
        self.delivery.lock().batches > 0
    }

    async fn fetch_update_seq(&self) -> Result<SequenceNumber> {
        let request = HttpRequest::new(Method::GET, self.db_url.clone());
        let response = self.executor.execute(request).await?.into_result()?;
        let info: DatabaseInfo = response.json()?;
        Ok(info.update_seq)
    }

    fn feed_url(&self, since: SequenceNumber) -> Result<Url> {
        let mut url = self.db_url.join("_changes")?;
        url.query_pairs_mut()
            .append_pair("feed", "continuous")
            .append_pair("since", &since.to_string())
            .append_pair("heartbeat", &self.heartbeat_ms.to_string());
        Ok(url)
    }

    async fn run_feed(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.state() == TrackingState::Disabled {
                return;
            }
            let since = self.last_seq.lock().unwrap_or(0);
            let url = match self.feed_url(since) {
                Ok(url) => url,
                Err(err) => {
                    tracing::error!(error = %err, "cannot build change feed URL");
                    *self.state.lock() = TrackingState::Disabled;
                    return;
                }
            };

            match self.executor.stream(HttpRequest::new(Method::GET, url)).await {
                Ok(mut stream) => {
                    self.set_state_unless_disabled(TrackingState::Streaming);
                    attempt = 0;
                    tracing::debug!(db = %self.db_url, since, "change feed open");
                    let mut decoder = FeedDecoder::new();
                    'read: while let Some(chunk) = stream.next().await {
                        if self.state() == TrackingState::Disabled {
                            return;
                        }
                        match chunk {
                            Ok(bytes) => {
                                for event in decoder.feed(&bytes) {
                                    match event {
                                        Ok(FeedEvent::Change(change)) => self.process(change),
                                        Ok(FeedEvent::Heartbeat) => {}
                                        Ok(FeedEvent::End(seq)) => {
                                            self.advance_seq(seq);
                                            break 'read;
                                        }
                                        Err(err) => {
                                            tracing::warn!(error = %err, "skipping malformed change record");
                                        }
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "change feed transport error");
                                break 'read;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "change feed connect failed");
                }
            }

            if self.state() == TrackingState::Disabled {
                return;
            }
            self.set_state_unless_disabled(TrackingState::Reconnecting);
            let delay = backoff_delay(attempt, self.backoff_ms, self.max_backoff_ms);
            attempt = attempt.saturating_add(1);
            tracing::debug!(db = %self.db_url, ?delay, "reconnecting change feed");
            tokio::time::sleep(delay).await;
        }
    }

    /// Reconcile one feed record and deliver it if it survives.
    fn process(&self, change: DatabaseChange) {
        self.advance_seq(change.seq);
        if !self.tracker.apply_change(&change) {
            tracing::trace!(id = %change.id, seq = change.seq, "change suppressed");
            return;
        }
        // Deferral decision and delivery share one lock so notification
        // order always equals arrival order, even against a concurrent
        // batch-completion flush.
        let mut delivery = self.delivery.lock();
        if delivery.batches > 0 {
            delivery.deferred.push_back(change);
        } else {
            self.fan_out(&change);
        }
    }

    fn fan_out(&self, change: &DatabaseChange) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn advance_seq(&self, seq: SequenceNumber) {
        let mut last = self.last_seq.lock();
        if last.map_or(true, |current| seq > current) {
            *last = Some(seq);
        }
    }

    fn set_state_unless_disabled(&self, next: TrackingState) {
        let mut state = self.state.lock();
        if *state != TrackingState::Disabled {
            *state = next;
        }
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    Duration::from_millis(delay.min(max_ms))
}
