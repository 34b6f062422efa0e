//! Filesystem-backed document store for `csfle`.
//!
//! Suitable for development, tests and single-host deployments. Uniqueness
//! is enforced by the filesystem itself, so several processes sharing one
//! directory still get at most one document per unique value.

#![warn(clippy::pedantic, clippy::nursery)]

use csfle::error::StoreError;
use csfle::namespace::Namespace;
use csfle::store::{
    ensure_id, indexed_values, matches_filter, ConnectionOptions, Connector, Document,
    DocumentStore, IndexOutcome,
};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const DOCS_DIR: &str = "docs";
const UNIQUE_DIR: &str = "unique";
const INDEXES_DIR: &str = "indexes";

/// Document store rooted at a directory.
///
/// Layout:
/// ```text
/// root/
/// └── <database>/<collection>/
///     ├── docs/<hex(_id)>.json
///     ├── indexes/<field>                 (one marker per unique index)
///     └── unique/<field>/<hex(value)>     (hard link to the owning document)
/// ```
///
/// Documents are written to a temporary file and hard-linked into place.
/// Creating a link fails if the name exists, which makes every claim on an
/// `_id` or a unique value atomic across processes.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, namespace: &Namespace) -> Result<PathBuf, StoreError> {
        for part in [namespace.database(), namespace.collection()] {
            if part.contains(['/', '\\']) || part == ".." {
                return Err(StoreError::InvalidDocument(format!(
                    "namespace {namespace} cannot be used as a directory"
                )));
            }
        }
        Ok(self.root.join(namespace.database()).join(namespace.collection()))
    }

    fn unique_fields(dir: &Path) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(dir.join(INDEXES_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut fields = Vec::new();
        for entry in entries {
            if let Some(name) = entry?.file_name().to_str() {
                fields.push(name.to_string());
            }
        }
        Ok(fields)
    }

    fn read_document(path: &Path) -> Result<Option<Document>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(dir: &Path, filter: &Document) -> Result<Option<Document>, StoreError> {
        let entries = match fs::read_dir(dir.join(DOCS_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            if let Some(document) = Self::read_document(&path)? {
                if matches_filter(&document, filter) {
                    return Ok(Some(document));
                }
            }
        }
        Ok(None)
    }

    fn link_document(dir: &Path, tmp: &Path, document: &Document, id: &Value) -> Result<(), StoreError> {
        let mut claims = Vec::new();
        for field in Self::unique_fields(dir)? {
            for value in indexed_values(document, &field) {
                let target = unique_path(dir, &field, &value);
                if let Err(e) = claim(tmp, &target, &field, &value) {
                    release(&claims);
                    return Err(e);
                }
                claims.push(target);
            }
        }
        if let Err(e) = claim(tmp, &doc_path(dir, id), "_id", id) {
            release(&claims);
            return Err(e);
        }
        Ok(())
    }

    /// Adds entries for documents stored before the index existed.
    fn backfill(dir: &Path, field: &str, claims: &mut Vec<PathBuf>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir.join(DOCS_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(document) = Self::read_document(&path)? else {
                continue;
            };
            for value in indexed_values(&document, field) {
                let target = unique_path(dir, field, &value);
                match claim(&path, &target, field, &value) {
                    Ok(()) => claims.push(target),
                    Err(e) if e.is_duplicate_key() => {
                        // a concurrent insert may already have claimed it for this document
                        let owner = Self::read_document(&target)?;
                        if owner.as_ref().and_then(|d| d.get("_id")) != document.get("_id") {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn entry_name(value: &Value) -> String {
    hex::encode(value.to_string())
}

fn doc_path(dir: &Path, id: &Value) -> PathBuf {
    dir.join(DOCS_DIR).join(format!("{}.json", entry_name(id)))
}

fn unique_path(dir: &Path, field: &str, value: &Value) -> PathBuf {
    dir.join(UNIQUE_DIR).join(field).join(entry_name(value))
}

/// Links `source` to `target`, mapping an existing target to `DuplicateKey`.
fn claim(source: &Path, target: &Path, field: &str, value: &Value) -> Result<(), StoreError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::DuplicateKey {
            field: field.to_string(),
            value: value.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn release(claims: &[PathBuf]) {
    for path in claims {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), "failed to roll back unique claim: {e}");
        }
    }
}

impl DocumentStore for FileStore {
    fn insert_one(&self, namespace: &Namespace, document: Document) -> Result<Value, StoreError> {
        let dir = self.collection_dir(namespace)?;
        let mut document = document;
        let id = ensure_id(&mut document);

        let docs = dir.join(DOCS_DIR);
        fs::create_dir_all(&docs)?;
        let tmp = docs.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec(&document)?)?;

        let result = Self::link_document(&dir, &tmp, &document, &id);

        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), "failed to remove temporary document: {e}");
        }
        result.map(|()| id)
    }

    fn find_one(
        &self,
        namespace: &Namespace,
        filter: &Document,
    ) -> Result<Option<Document>, StoreError> {
        let dir = self.collection_dir(namespace)?;

        if let Some(id) = filter.get("_id") {
            let found = Self::read_document(&doc_path(&dir, id))?;
            return Ok(found.filter(|d| matches_filter(d, filter)));
        }

        for field in Self::unique_fields(&dir)? {
            match filter.get(&field) {
                Some(value) if !value.is_object() && !value.is_array() => {
                    let found = Self::read_document(&unique_path(&dir, &field, value))?;
                    return Ok(found.filter(|d| matches_filter(d, filter)));
                }
                _ => {}
            }
        }

        Self::scan(&dir, filter)
    }

    fn create_unique_index(
        &self,
        namespace: &Namespace,
        field: &str,
    ) -> Result<IndexOutcome, StoreError> {
        if field.is_empty() || field.contains(['/', '\\']) {
            return Err(StoreError::InvalidDocument(format!("cannot index field {field:?}")));
        }
        let dir = self.collection_dir(namespace)?;
        let indexes = dir.join(INDEXES_DIR);
        fs::create_dir_all(&indexes)?;

        let marker = indexes.join(field);
        match fs::OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(IndexOutcome::AlreadyExists),
            Err(e) => return Err(e.into()),
        }

        let mut claims = Vec::new();
        let backfill = Self::backfill(&dir, field, &mut claims);

        match backfill {
            Ok(()) => {
                debug!(namespace = %namespace, field, "created unique index");
                Ok(IndexOutcome::Created)
            }
            Err(e) => {
                release(&claims);
                release(&[marker]);
                Err(e)
            }
        }
    }
}

/// Opens [`FileStore`]s for `file://<dir>` descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConnector;

impl Connector for FileConnector {
    fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let location = options.location();
        if location.is_empty() {
            return Err(StoreError::Unavailable(format!(
                "no directory in connection string {}",
                options.uri()
            )));
        }
        let store = FileStore::open(location).map_err(|e| {
            StoreError::Unavailable(format!("cannot open file store at {location}: {e}"))
        })?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn vault() -> Namespace {
        Namespace::new("encryption", "__keyVault").unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let id = store.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"], "n": 1}))).unwrap();
        let by_id = store.find_one(&vault(), &doc(json!({"_id": id}))).unwrap().unwrap();
        assert_eq!(by_id["n"], 1);

        let by_member = store.find_one(&vault(), &doc(json!({"keyAltNames": "k1"}))).unwrap();
        assert!(by_member.is_some());
        assert!(store.find_one(&vault(), &doc(json!({"keyAltNames": "k2"}))).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_id() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.insert_one(&vault(), doc(json!({"_id": "a"}))).unwrap();
        let err = store.insert_one(&vault(), doc(json!({"_id": "a"}))).unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn test_unique_index_rejects_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.create_unique_index(&vault(), "keyAltNames").unwrap(), IndexOutcome::Created);
        assert_eq!(
            store.create_unique_index(&vault(), "keyAltNames").unwrap(),
            IndexOutcome::AlreadyExists
        );

        store.insert_one(&vault(), doc(json!({"_id": "a", "keyAltNames": ["k1"]}))).unwrap();
        let err = store
            .insert_one(&vault(), doc(json!({"_id": "b", "keyAltNames": ["k2", "k1"]})))
            .unwrap_err();
        assert!(err.is_duplicate_key());

        // the rejected document left no claim on k2
        store.insert_one(&vault(), doc(json!({"_id": "c", "keyAltNames": ["k2"]}))).unwrap();
        assert!(store.find_one(&vault(), &doc(json!({"_id": "b"}))).unwrap().is_none());
    }

    #[test]
    fn test_index_over_existing_duplicates_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"]}))).unwrap();
        store.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"]}))).unwrap();

        assert!(store.create_unique_index(&vault(), "keyAltNames").unwrap_err().is_duplicate_key());
        // the failed build leaves no index behind
        store.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"]}))).unwrap();
    }

    #[test]
    fn test_independent_handles_share_constraint() {
        let dir = TempDir::new().unwrap();
        let a = FileStore::open(dir.path()).unwrap();
        let b = FileStore::open(dir.path()).unwrap();
        a.create_unique_index(&vault(), "keyAltNames").unwrap();

        a.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"]}))).unwrap();
        assert!(b.insert_one(&vault(), doc(json!({"keyAltNames": ["k1"]}))).unwrap_err().is_duplicate_key());
    }

    #[test]
    fn test_connector() {
        let dir = TempDir::new().unwrap();
        let uri = format!("file://{}", dir.path().join("db").display());
        let store = FileConnector.connect(&ConnectionOptions::new(uri)).unwrap();
        store.insert_one(&vault(), doc(json!({"x": 1}))).unwrap();
        assert!(dir.path().join("db/encryption/__keyVault/docs").is_dir());

        assert!(FileConnector.connect(&ConnectionOptions::new("file://")).is_err());
    }
}
