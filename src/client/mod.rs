//! HTTP plumbing: the executor seam, the operation model, and configuration.
//!
//! ```text
//! client/
//! ├── config    - ClientConfig
//! ├── executor  - RequestExecutor trait + reqwest implementation
//! └── operation - write-once completion cell over one request
//! ```
//!
//! Everything above this module (resources, cache, tracker, changes) issues
//! requests by building an [`HttpRequest`] and handing it to
//! [`Operation::issue`] or awaiting the executor directly. Nothing above
//! this module knows about `reqwest`.

mod config;
mod executor;
mod operation;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ClientConfig;
pub use executor::{ByteStream, HttpExecutor, HttpRequest, HttpResponse, RequestExecutor};
pub use operation::Operation;
