//! Public surface: database handle, collection and document references.
//!
//! A [`LarkDB`] handle owns one session (and optionally one cache) per api
//! key. Handles are deduplicated through an explicit process-wide registry;
//! [`LarkDB::destroy`] removes the handle and tears the session down.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::{Cache, CacheOptions};
use crate::document::Document;
use crate::error::{Error, ExecutionErrorKind, InvalidDataKind, Result};
use crate::network::{Connector, WsConnector};
use crate::protocol::{ClientRequest, WriteDocument};
use crate::query::{field, Direction, Filter, Ordering, Query, KEY_PATH_ID};
use crate::session::{SessionConfig, SessionHandle};
use crate::subscription::SubscriptionUpdate;

/// Process-wide registry of live handles, one per api key.
fn registry() -> &'static Mutex<HashMap<String, LarkDB>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, LarkDB>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Configuration for a [`LarkDB`] handle.
pub struct LarkOptions {
    api_key: String,
    auth_token: Option<String>,
    cache_enabled: bool,
    cache: CacheOptions,
    request_timeout: Option<Duration>,
    heartbeat_interval: Duration,
    connector: Option<Arc<dyn Connector>>,
}

impl LarkOptions {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            auth_token: None,
            cache_enabled: false,
            cache: CacheOptions::default(),
            request_timeout: None,
            heartbeat_interval: SessionConfig::default_heartbeat(),
            connector: None,
        }
    }

    /// Authorization token sent right after every connection is established.
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Enables the on-disk cache for offline reads.
    pub fn with_cache(mut self) -> Self {
        self.cache_enabled = true;
        self
    }

    /// Evict cached datasets older than `ttl` on open.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = Some(ttl);
        self
    }

    /// On-disk size cap for the cache.
    pub fn with_cache_max_size(mut self, max_size: u64) -> Self {
        self.cache.max_size = max_size;
        self
    }

    /// Directory used instead of the platform cache root.
    pub fn with_cache_root(mut self, root: std::path::PathBuf) -> Self {
        self.cache.root = Some(root);
        self
    }

    /// Per-request timeout. Without it only connection requests time out.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Overrides the heartbeat interval (mainly for tests).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Swaps the WebSocket transport for a custom one.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Handle to one LarkDB database.
///
/// Cloning is cheap; all clones share the same session. Requires a tokio
/// runtime: the session, network, and cache workers are spawned on creation.
#[derive(Clone)]
pub struct LarkDB {
    inner: Arc<DbInner>,
}

struct DbInner {
    api_key: String,
    session: SessionHandle,
}

impl LarkDB {
    /// Returns the existing handle for `api_key`, or creates one with
    /// default options.
    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if let Some(db) = registry().lock().get(&api_key) {
            return Ok(db.clone());
        }
        Self::with_options(LarkOptions::new(api_key))
    }

    /// Creates (or returns) the handle described by `options`.
    pub fn with_options(options: LarkOptions) -> Result<Self> {
        // Held across creation so concurrent calls cannot race two sessions
        // into existence for the same key.
        let mut handles = registry().lock();
        if let Some(db) = handles.get(&options.api_key) {
            return Ok(db.clone());
        }

        let url = url_from_api_key(&options.api_key)?;
        let cache = if options.cache_enabled {
            Some(Cache::open(&options.api_key, options.cache.clone())?)
        } else {
            None
        };
        let connector = options
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector));
        let session = SessionHandle::spawn(SessionConfig {
            url,
            connector,
            cache,
            auth_token: options.auth_token,
            request_timeout: options.request_timeout,
            heartbeat_interval: options.heartbeat_interval,
        });

        let db = Self {
            inner: Arc::new(DbInner { api_key: options.api_key.clone(), session }),
        };
        handles.insert(options.api_key, db.clone());
        Ok(db)
    }

    /// The api key this handle was created with.
    pub fn api_key(&self) -> &str {
        &self.inner.api_key
    }

    /// Generates a new document id.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// A reference to the named collection.
    pub fn collection(&self, collection_id: impl Into<String>) -> CollectionRef {
        CollectionRef {
            db: self.clone(),
            collection_id: collection_id.into(),
            query: Query::default(),
        }
    }

    /// Sends an authorization request; resolves once the server accepts the
    /// token. The token is replayed after every reconnect.
    pub async fn authorize(&self, token: impl Into<String>) -> Result<()> {
        self.inner.session.authorize(token.into()).await
    }

    /// Drops the current authorization.
    pub async fn deauthorize(&self) -> Result<()> {
        self.inner.session.deauthorize().await
    }

    /// Closes the transport intentionally; cached reads keep working.
    pub fn go_offline(&self) {
        self.inner.session.go_offline();
    }

    /// Re-opens the transport after [`go_offline`](Self::go_offline).
    pub fn go_online(&self) {
        self.inner.session.go_online();
    }

    /// Unregisters the handle and tears down its session. Pending requests
    /// fail with `ConnectionTerminated`.
    pub fn destroy(&self) {
        registry().lock().remove(&self.inner.api_key);
        self.inner.session.destroy();
    }

    fn session(&self) -> &SessionHandle {
        &self.inner.session
    }
}

/// The api key is the base64-encoded host of the database endpoint.
fn url_from_api_key(api_key: &str) -> Result<String> {
    let bytes = BASE64
        .decode(api_key)
        .map_err(|_| Error::Other("api key is not valid base64".to_string()))?;
    let host = String::from_utf8(bytes)
        .map_err(|_| Error::Other("api key does not decode to a host".to_string()))?;
    if host.is_empty() {
        return Err(Error::Other("api key decodes to an empty host".to_string()));
    }
    Ok(format!("ws://{}", host))
}

/// Immutable query builder over one collection.
#[derive(Clone)]
pub struct CollectionRef {
    db: LarkDB,
    collection_id: String,
    query: Query,
}

impl CollectionRef {
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// ANDs `filter` onto the accumulated filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.query.add_filter(filter);
        self
    }

    /// Appends an ordering descriptor; earlier calls stay primary.
    pub fn order(mut self, key_path: impl Into<String>, direction: Direction) -> Self {
        self.query.add_ordering(Ordering::new(key_path, direction));
        self
    }

    /// Skips the first `n` matching documents.
    pub fn skip(mut self, n: u32) -> Self {
        self.query.paging.skip = Some(n);
        self
    }

    /// Bounds the result window to `n` documents (at most 500).
    pub fn take(mut self, n: u32) -> Self {
        self.query.paging.take = Some(n);
        self
    }

    /// Opens a standing subscription over this query. Equivalent queries
    /// share one server-side registration; a late subscriber receives the
    /// last known value immediately.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let reply = self
            .db
            .session()
            .subscribe(self.collection_id.clone(), self.query.clone())
            .await?;
        Ok(Subscription {
            session: self.db.session().clone(),
            subscription_id: reply.subscription_id,
            listener_id: reply.listener_id,
            rx: reply.rx,
        })
    }

    /// One-shot read of this query.
    pub async fn fetch(&self) -> Result<Vec<Document>> {
        self.db
            .session()
            .fetch(self.collection_id.clone(), self.query.clone())
            .await
    }

    /// A reference to one document in this collection.
    pub fn document(&self, document_id: impl Into<String>) -> DocumentRef {
        DocumentRef {
            db: self.db.clone(),
            collection_id: self.collection_id.clone(),
            document_id: document_id.into(),
        }
    }

    /// A reference to a new document with a generated id.
    pub fn new_document(&self) -> DocumentRef {
        self.document(LarkDB::generate_id())
    }
}

/// Outcome of one round of an optimistic execution block.
pub enum ExecutionResult {
    /// Replace the document with this value.
    Write(Value),
    /// Delete the document.
    Delete,
    /// Give up; the execution fails with `ExecutionFailed(Aborted)`.
    Abort,
}

/// Reference to one document.
#[derive(Clone)]
pub struct DocumentRef {
    db: LarkDB,
    collection_id: String,
    document_id: String,
}

impl DocumentRef {
    pub fn id(&self) -> &str {
        &self.document_id
    }

    /// Overwrites the document unconditionally.
    pub async fn mutate(&self, value: Value) -> Result<()> {
        self.mutate_with_etag(value, None).await
    }

    /// Overwrites the document only if its etag still matches.
    pub async fn mutate_with_etag(&self, value: Value, etag: Option<String>) -> Result<()> {
        let body = into_body(value)?;
        self.db
            .session()
            .write(ClientRequest::Mutate {
                collection_id: self.collection_id.clone(),
                document: WriteDocument { id: self.document_id.clone(), etag, body },
            })
            .await
    }

    /// Merges `value` into the document, leaving unmentioned keys alone.
    pub async fn merge(&self, value: Value) -> Result<()> {
        self.merge_with_etag(value, None).await
    }

    pub async fn merge_with_etag(&self, value: Value, etag: Option<String>) -> Result<()> {
        let body = into_body(value)?;
        self.db
            .session()
            .write(ClientRequest::Merge {
                collection_id: self.collection_id.clone(),
                document: WriteDocument { id: self.document_id.clone(), etag, body },
            })
            .await
    }

    /// Deletes the document unconditionally.
    pub async fn delete(&self) -> Result<()> {
        self.delete_with_etag(None).await
    }

    pub async fn delete_with_etag(&self, etag: Option<String>) -> Result<()> {
        self.db
            .session()
            .write(ClientRequest::Delete {
                collection_id: self.collection_id.clone(),
                id: self.document_id.clone(),
                etag,
            })
            .await
    }

    /// One-shot read; `None` when the document does not exist (or is
    /// deleted).
    pub async fn fetch(&self) -> Result<Option<Document>> {
        let query = self.id_query();
        let documents = self
            .db
            .session()
            .fetch(self.collection_id.clone(), query)
            .await?;
        Ok(documents.into_iter().find(|d| !d.is_tombstone()))
    }

    /// Subscribes to this single document.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let reply = self
            .db
            .session()
            .subscribe(self.collection_id.clone(), self.id_query())
            .await?;
        Ok(Subscription {
            session: self.db.session().clone(),
            subscription_id: reply.subscription_id,
            listener_id: reply.listener_id,
            rx: reply.rx,
        })
    }

    /// Optimistic execution: fetch, transform, write with the fetched etag;
    /// on a write conflict the cycle restarts with a fresh fetch.
    pub async fn execute<F>(&self, mut block: F) -> Result<()>
    where
        F: FnMut(Option<&Map<String, Value>>) -> ExecutionResult,
    {
        loop {
            let current = self.fetch().await?;
            let etag = current.as_ref().and_then(|d| d.etag.clone());

            let outcome = block(current.as_ref().and_then(|d| d.value.as_ref()));
            let result = match outcome {
                ExecutionResult::Write(value) => self.mutate_with_etag(value, etag).await,
                ExecutionResult::Delete => self.delete_with_etag(etag).await,
                ExecutionResult::Abort => {
                    return Err(Error::ExecutionFailed(ExecutionErrorKind::Aborted));
                }
            };
            match result {
                Err(Error::ExecutionFailed(ExecutionErrorKind::WriteConflict)) => {
                    log::debug!("write conflict on {}, retrying", self.document_id);
                    continue;
                }
                other => return other,
            }
        }
    }

    fn id_query(&self) -> Query {
        let mut query = Query::default();
        query.add_filter(field(KEY_PATH_ID).eq(self.document_id.clone()));
        query
    }
}

fn into_body(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::InvalidData(InvalidDataKind::InvalidDocument)),
    }
}

/// A standing subscription. Await [`next`](Self::next) for deliveries; drop
/// to unsubscribe (the last listener for a query triggers the wire
/// unsubscribe).
pub struct Subscription {
    session: SessionHandle,
    subscription_id: String,
    listener_id: u64,
    rx: mpsc::UnboundedReceiver<Result<SubscriptionUpdate>>,
}

impl Subscription {
    /// The next delivery, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<SubscriptionUpdate>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session
            .remove_listener(self.subscription_id.clone(), self.listener_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_from_api_key() {
        // "localhost:8090" base64-encoded
        let api_key = BASE64.encode("localhost:8090");
        assert_eq!(url_from_api_key(&api_key).unwrap(), "ws://localhost:8090");

        assert!(url_from_api_key("!!!not-base64!!!").is_err());
        assert!(url_from_api_key("").is_err());
    }

    #[test]
    fn test_generated_ids_are_valid_identifiers() {
        let id = LarkDB::generate_id();
        assert!(crate::protocol::validate_identifier(&id).is_ok());
        assert_ne!(LarkDB::generate_id(), LarkDB::generate_id());
    }
}
