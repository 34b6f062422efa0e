//! Document store abstraction.
//!
//! The database driver is a collaborator: this module only fixes the small
//! surface the key vault and the clients need (insert, equality lookup and
//! unique indexes) plus connection descriptors and scheme routing.

use crate::error::StoreError;
use crate::namespace::Namespace;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A stored document.
pub type Document = Map<String, Value>;

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a unique index request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The index was built by this call
    Created,
    /// An identical index already existed
    AlreadyExists,
}

/// Minimal document store operations.
///
/// Filters are equality matches on (possibly dotted) field paths; a filter
/// value also matches an array field that contains it.
pub trait DocumentStore: Send + Sync {
    /// Inserts a document and returns its `_id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if a unique index rejects the
    /// document.
    fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<Value, StoreError>;

    /// Returns the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError>;

    /// Ensures a unique index exists on `field`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if existing documents already
    /// violate the constraint.
    fn create_unique_index(
        &self,
        namespace: &Namespace,
        field: &str,
    ) -> Result<IndexOutcome, StoreError>;
}

/// Connection descriptor with transport bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    uri: String,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl ConnectionOptions {
    /// Creates options for `uri` with default timeouts.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Returns the connection URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the URI scheme (`memory`, `file`, ...), if any.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.uri.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Returns everything after `scheme://`.
    #[must_use]
    pub fn location(&self) -> &str {
        self.uri.split_once("://").map_or(self.uri.as_str(), |(_, rest)| rest)
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the per-operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

/// Opens document stores from connection descriptors.
pub trait Connector: Send + Sync {
    /// Connects to the store described by `options`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store cannot be reached.
    fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// Dispatches connections to a backend by URI scheme.
#[derive(Default, Clone)]
pub struct SchemeRouter {
    backends: HashMap<String, Arc<dyn Connector>>,
}

impl SchemeRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connector` for `scheme`.
    #[must_use]
    pub fn with(mut self, scheme: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.backends.insert(scheme.into(), connector);
        self
    }
}

impl Connector for SchemeRouter {
    fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let scheme = options.scheme().ok_or_else(|| {
            StoreError::Unavailable(format!("connection string has no scheme: {}", options.uri()))
        })?;
        let backend = self.backends.get(scheme).ok_or_else(|| {
            let mut known: Vec<&str> = self.backends.keys().map(String::as_str).collect();
            known.sort_unstable();
            StoreError::Unavailable(format!(
                "unsupported scheme {scheme:?} (supported: {})",
                known.join(", ")
            ))
        })?;
        backend.connect(options)
    }
}

/// Runs `op` on a helper thread and gives up after `timeout`.
///
/// An operation that times out keeps running to completion in the
/// background; its result is discarded.
///
/// # Errors
///
/// Returns `StoreError::Timeout` if `op` does not finish in time, otherwise
/// whatever `op` returns.
pub fn run_bounded<T, F>(timeout: Duration, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new().name("csfle-store-op".to_string()).spawn(move || {
        let _ = tx.send(op());
    })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(StoreError::Unavailable("store operation aborted".to_string()))
        }
    }
}

/// Store wrapper that bounds every operation by a fixed timeout.
pub struct BoundedStore {
    inner: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl BoundedStore {
    /// Wraps `inner`, bounding each call by `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl DocumentStore for BoundedStore {
    fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<Value, StoreError> {
        let inner = Arc::clone(&self.inner);
        let namespace = namespace.clone();
        run_bounded(self.timeout, move || inner.insert_one(&namespace, document))
    }

    fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError> {
        let inner = Arc::clone(&self.inner);
        let namespace = namespace.clone();
        let filter = filter.clone();
        run_bounded(self.timeout, move || inner.find_one(&namespace, &filter))
    }

    fn create_unique_index(
        &self,
        namespace: &Namespace,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        let inner = Arc::clone(&self.inner);
        let namespace = namespace.clone();
        let field = field.to_string();
        run_bounded(self.timeout, move || inner.create_unique_index(&namespace, &field))
    }
}

/// Connects through `connector` within the connect timeout and bounds every
/// operation on the resulting store by the operation timeout.
///
/// # Errors
///
/// Returns `StoreError::Timeout` if connecting takes too long, otherwise the
/// connector's error.
pub fn connect_bounded(
    connector: &Arc<dyn Connector>,
    options: &ConnectionOptions,
) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let pending = Arc::clone(connector);
    let owned = options.clone();
    let store = run_bounded(options.connect_timeout(), move || pending.connect(&owned))?;
    Ok(Arc::new(BoundedStore::new(store, options.operation_timeout())))
}

/// Returns the document's `_id`, assigning a fresh UUID string if absent.
pub fn ensure_id(document: &mut Document) -> Value {
    document
        .entry("_id")
        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()))
        .clone()
}

/// Resolves a dotted path inside a document.
#[must_use]
pub fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Values a unique index sees for `field`: array elements count individually.
#[must_use]
pub fn indexed_values(document: &Document, field: &str) -> Vec<Value> {
    match lookup_path(document, field) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(value) => vec![value.clone()],
    }
}

/// Returns `true` if `document` satisfies every equality in `filter`.
#[must_use]
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| match lookup_path(document, path) {
        Some(actual) if actual == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        _ => false,
    })
}
