//! In-process document store.
//!
//! Enforces unique indexes under a single lock, so concurrent provisioning
//! attempts from many threads serialize on the constraint exactly as they
//! would against a real vault. Supports fault injection for tests.

use crate::error::StoreError;
use crate::namespace::Namespace;
use crate::store::{
    ensure_id, indexed_values, matches_filter, ConnectionOptions, Connector, Document,
    DocumentStore, IndexOutcome,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Collection {
    documents: Vec<Document>,
    unique: BTreeSet<String>,
}

impl Collection {
    fn conflict(&self, document: &Document) -> Option<(String, Value)> {
        self.unique.iter().find_map(|field| {
            indexed_values(document, field).into_iter().find_map(|value| {
                self.documents
                    .iter()
                    .any(|existing| indexed_values(existing, field).contains(&value))
                    .then(|| (field.clone(), value))
            })
        })
    }
}

#[derive(Default)]
struct Inner {
    collections: HashMap<Namespace, Collection>,
    fail_next: usize,
}

/// Shared in-memory store; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Number of documents in `namespace`.
    #[must_use]
    pub fn count(&self, namespace: &Namespace) -> usize {
        self.lock().collections.get(namespace).map_or(0, |c| c.documents.len())
    }

    /// Snapshot of the raw documents in `namespace`.
    #[must_use]
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.lock().collections.get(namespace).map(|c| c.documents.clone()).unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(inner)
    }
}

impl DocumentStore for MemoryStore {
    fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<Value, StoreError> {
        let mut document = document;
        let id = ensure_id(&mut document);

        let mut inner = self.begin()?;
        let collection = inner.collections.entry(namespace.clone()).or_default();
        if collection.documents.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(StoreError::DuplicateKey { field: "_id".to_string(), value: id.to_string() });
        }
        if let Some((field, value)) = collection.conflict(&document) {
            return Err(StoreError::DuplicateKey { field, value: value.to_string() });
        }
        collection.documents.push(document);
        drop(inner);
        Ok(id)
    }

    fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError> {
        let inner = self.begin()?;
        Ok(inner
            .collections
            .get(namespace)
            .and_then(|c| c.documents.iter().find(|d| matches_filter(d, filter)))
            .cloned())
    }

    fn create_unique_index(
        &self,
        namespace: &Namespace,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        let mut inner = self.begin()?;
        let collection = inner.collections.entry(namespace.clone()).or_default();
        if collection.unique.contains(field) {
            return Ok(IndexOutcome::AlreadyExists);
        }

        let mut seen = Vec::new();
        for document in &collection.documents {
            for value in indexed_values(document, field) {
                if seen.contains(&value) {
                    return Err(StoreError::DuplicateKey {
                        field: field.to_string(),
                        value: value.to_string(),
                    });
                }
                seen.push(value);
            }
        }
        collection.unique.insert(field.to_string());
        drop(inner);
        Ok(IndexOutcome::Created)
    }
}

impl Connector for MemoryStore {
    fn connect(&self, _options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Hands out one shared [`MemoryStore`] per `memory://<name>` descriptor.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryConnector {
    /// Creates a connector with no stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store registered under `name`, creating it if needed.
    #[must_use]
    pub fn store(&self, name: &str) -> MemoryStore {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(self.store(options.location())))
    }
}
