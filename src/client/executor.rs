//! The request-executor seam: one trait the whole crate talks HTTP through.
//!
//! The core never touches a socket directly. Every resource issues
//! [`HttpRequest`]s against a [`RequestExecutor`], which performs exactly one
//! completion per request. The production implementation is
//! [`HttpExecutor`], backed by `reqwest`; tests substitute their own.
//!
//! Two calls cover everything the crate needs:
//!
//! - [`execute`](RequestExecutor::execute) - one request, one buffered
//!   response.
//! - [`stream`](RequestExecutor::stream) - one request, a stream of body
//!   chunks; used only by the change feed, which holds the connection open
//!   indefinitely.
//!
//! Transport, TLS, and auth all live behind this seam.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use super::config::ClientConfig;

/// A stream of raw body chunks from a long-lived response.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One HTTP request, fully described.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: Url,
    /// Extra headers beyond what the executor sets itself.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Build a bodyless request.
    pub fn new(method: Method, url: Url) -> Self {
        HttpRequest {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Attach a JSON body and the matching content type.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)?;
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(Bytes::from(encoded));
        Ok(self)
    }
}

/// One buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Numeric status code.
    pub status: u16,
    /// Response headers, lowercase keys.
    pub headers: BTreeMap<String, String>,
    /// Raw response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Classify this response into the crate's error taxonomy.
    ///
    /// 2xx passes through; 409 becomes [`Error::RevisionConflict`] (in this
    /// protocol a 409 is always a stale-revision write); anything else
    /// becomes [`Error::Status`] carrying the parsed error body if present.
    pub fn into_result(self) -> Result<HttpResponse> {
        if self.is_success() {
            return Ok(self);
        }
        if self.status == 409 {
            return Err(Error::RevisionConflict);
        }
        let body = serde_json::from_slice(&self.body).ok();
        Err(Error::Status {
            code: self.status,
            body,
        })
    }
}

/// Performs HTTP requests on behalf of the core.
///
/// Implementations must invoke exactly one completion per `execute` call.
/// Retry policy belongs to calling layers, never here.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    /// Perform one request and buffer the full response.
    ///
    /// A non-2xx status is *not* an error at this layer; classification
    /// happens in [`HttpResponse::into_result`] so callers can read error
    /// bodies.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Open one request and yield its body incrementally.
    ///
    /// Used for the continuous change feed. A non-2xx status is an error
    /// here: there is no feed to stream.
    async fn stream(&self, request: HttpRequest) -> Result<ByteStream>;
}

/// Production executor backed by `reqwest`.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpExecutor {
    /// Build an executor with default configuration.
    pub fn new() -> Self {
        Self::with_config(&ClientConfig::default())
    }

    /// Build an executor from a [`ClientConfig`].
    ///
    /// The per-request timeout is applied per call in [`execute`]; the
    /// client itself carries no global timeout so the change feed can stay
    /// open indefinitely.
    ///
    /// [`execute`]: RequestExecutor::execute
    pub fn with_config(config: &ClientConfig) -> Self {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_idle_per_host);

        if !config.proxy_url.is_empty() {
            if let Ok(proxy) = reqwest::Proxy::all(&config.proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        HttpExecutor {
            client: builder.build().unwrap_or_default(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    fn builder(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tracing::debug!(method = %request.method, url = %request.url, "executing request");
        let response = self
            .builder(&request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), text.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn stream(&self, request: HttpRequest) -> Result<ByteStream> {
        tracing::debug!(url = %request.url, "opening streaming request");
        let response = self
            .builder(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.bytes().await.unwrap_or_default();
            return Err(Error::Status {
                code: status,
                body: serde_json::from_slice(&body).ok(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(e.to_string())))
            .boxed())
    }
}
