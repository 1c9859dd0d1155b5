//! In-process executor double for unit tests. No sockets involved.

use crate::client::executor::{ByteStream, HttpRequest, HttpResponse, RequestExecutor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Scripted executor: answers `execute` calls from a queue of canned
/// outcomes and records every request it sees.
#[derive(Default)]
pub(crate) struct MockExecutor {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    stream_chunks: Mutex<Vec<Vec<Result<Bytes>>>>,
    pub(crate) requests: Mutex<Vec<HttpRequest>>,
}

impl MockExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_response(&self, status: u16, body: &str) {
        self.responses.lock().push_back(Ok(HttpResponse {
            status,
            headers: BTreeMap::new(),
            body: Bytes::from(body.to_string()),
        }));
    }

    pub(crate) fn push_error(&self, error: Error) {
        self.responses.lock().push_back(Err(error));
    }

    /// Queue one feed connection's worth of chunks.
    pub(crate) fn push_stream(&self, chunks: Vec<Result<Bytes>>) {
        self.stream_chunks.lock().push(chunks);
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl RequestExecutor for MockExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Transport("mock exhausted".into())))
    }

    async fn stream(&self, request: HttpRequest) -> Result<ByteStream> {
        self.requests.lock().push(request);
        let chunks = {
            let mut streams = self.stream_chunks.lock();
            if streams.is_empty() {
                return Err(Error::Transport("no scripted feed".into()));
            }
            streams.remove(0)
        };
        Ok(futures::stream::iter(chunks).boxed())
    }
}
