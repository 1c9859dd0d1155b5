//! Error types for CouchDB client operations.
//!
//! The [`Result`] type alias provides a convenient shorthand for operations
//! that may fail.
//!
//! # Error Categories
//!
//! | Category | Variants | Retryable |
//! |----------|----------|-----------|
//! | Network | `Transport` | Yes |
//! | Server | `Status`, `RevisionConflict` | Depends on status |
//! | Data | `Decode` | No |
//! | Internal | `CacheConsistency`, `Url` | No |
//!
//! A [`RevisionConflict`](Error::RevisionConflict) is a 409 surfaced with its
//! own variant because callers commonly need to refetch the document and
//! retry the write with the current revision; it is never retried
//! automatically.

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the server or decoding its
/// responses.
///
/// All variants are `Clone` so a completed [`Operation`](crate::Operation)
/// can replay its outcome to any number of waiters and callbacks.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Connection-level failure (DNS, refused connection, dropped socket).
    ///
    /// Never silently retried by an individual operation; the change
    /// subscription treats it as a reconnect trigger.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status.
    ///
    /// Carries the numeric code and the parsed error body, if the server
    /// sent one (CouchDB answers errors with `{"error": ..., "reason": ...}`).
    #[error("HTTP status {code}")]
    Status {
        /// Numeric HTTP status code.
        code: u16,
        /// Parsed JSON error body, when present.
        body: Option<serde_json::Value>,
    },

    /// A document write named a revision that is no longer current (HTTP 409).
    ///
    /// Refetch the document to learn the current revision, then retry.
    #[error("document update conflict")]
    RevisionConflict,

    /// A response or feed record was not the expected structured data.
    #[error("decode error: {0}")]
    Decode(String),

    /// Two distinct objects were observed for one cache path.
    ///
    /// Unreachable under correct locking; fatal in debug builds, logged and
    /// ignored in release. The original mapping is kept either way.
    #[error("cache consistency violation: {0}")]
    CacheConsistency(String),

    /// A resource path could not be joined into a valid URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl Error {
    /// Check if this error is worth retrying.
    ///
    /// `true` for transport failures and the transient HTTP statuses
    /// (408, 425, 429, 502, 503, 504). Conflicts and decode failures are
    /// permanent: retrying the identical request cannot succeed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status { code, .. } => matches!(code, 408 | 425 | 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}
