//! The server handle: the root resource and factory for databases.

use crate::cache::ResourceCache;
use crate::client::{ClientConfig, HttpExecutor, HttpRequest, Operation, RequestExecutor};
use crate::database::Database;
use crate::error::Result;
use crate::types::{ServerInfo, UuidsResponse};
use http::Method;
use std::sync::Arc;
use url::Url;

/// A CouchDB-style server, addressed by its base URL.
///
/// The server is the factory for [`Database`] objects and keeps them
/// identity-cached: asking for the same name twice yields the same object.
///
/// # Examples
///
/// ```ignore
/// use davenport::Server;
///
/// #[tokio::main]
/// async fn main() -> davenport::Result<()> {
///     let server = Server::new("http://localhost:5984")?;
///     let db = server.database("mail")?;
///     let doc = db.document("welcome")?;
///     println!("{}", doc.get().await?);
///     Ok(())
/// }
/// ```
pub struct Server {
    url: Url,
    executor: Arc<dyn RequestExecutor>,
    config: ClientConfig,
    databases: ResourceCache<Database>,
}

impl Server {
    /// Connect-lazily to the server at `url` with default configuration.
    ///
    /// No request is made until a resource is used.
    pub fn new(url: &str) -> Result<Arc<Server>> {
        Self::with_config(url, ClientConfig::default())
    }

    /// Like [`new`](Self::new) with explicit configuration.
    pub fn with_config(url: &str, config: ClientConfig) -> Result<Arc<Server>> {
        let executor = Arc::new(HttpExecutor::with_config(&config));
        Self::with_executor(url, executor, config)
    }

    /// Build a server over a custom [`RequestExecutor`].
    ///
    /// The seam for substituting transports (and for tests).
    pub fn with_executor(
        url: &str,
        executor: Arc<dyn RequestExecutor>,
        config: ClientConfig,
    ) -> Result<Arc<Server>> {
        let mut url = Url::parse(url)?;
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        Ok(Arc::new(Server {
            databases: ResourceCache::new(config.database_retain_limit),
            url,
            executor,
            config,
        }))
    }

    /// The server base URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The database object named `name`.
    ///
    /// Makes no server calls; the database does not need to exist yet (see
    /// [`Database::create`]). Identity-cached per server.
    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases.try_get_or_insert(name, || {
            Database::new(name, &self.url, Arc::clone(&self.executor), &self.config)
        })
    }

    /// The server version string (`GET /`).
    pub async fn version(&self) -> Result<String> {
        let request = HttpRequest::new(Method::GET, self.url.clone());
        let info: ServerInfo = Operation::issue(Arc::clone(&self.executor), request)
            .result()
            .await?;
        Ok(info.version)
    }

    /// Ask the server for `count` fresh UUIDs, in order.
    ///
    /// `count` of zero yields an empty sequence, not an error.
    pub async fn generate_uuids(&self, count: usize) -> Result<Vec<String>> {
        let mut url = self.url.join("_uuids")?;
        url.query_pairs_mut()
            .append_pair("count", &count.to_string());
        let request = HttpRequest::new(Method::GET, url);
        let parsed: UuidsResponse = Operation::issue(Arc::clone(&self.executor), request)
            .result()
            .await?;
        Ok(parsed.uuids)
    }

    /// Empty the database cache. Subsequent [`database`](Self::database)
    /// calls return new instances.
    pub fn clear_database_cache(&self) {
        self.databases.clear();
    }
}
