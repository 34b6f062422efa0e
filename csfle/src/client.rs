//! Encrypted and plain clients.
//!
//! An [`EncryptedClient`] encrypts schema fields before documents leave the
//! process and decrypts every field-level ciphertext it reads back. A
//! [`PlainClient`] talks to the same store without any of that and exists
//! to inspect what was actually stored.
//!
//! Both handles own their resources and release them when dropped, so every
//! exit path (including `?` on an error) closes them.

use crate::agent::{self, CryptoAgent, CryptoAgentLocator};
use crate::binary::Binary;
use crate::cipher::{ciphertext_key_id, FieldCipher};
use crate::error::Error;
use crate::key_vault::{KeyId, KeyVaultManager};
use crate::kms::Kms;
use crate::namespace::Namespace;
use crate::schema::{Algorithm, BsonType, EncryptionSchema, FieldRule};
use crate::store::{connect_bounded, ensure_id, ConnectionOptions, Connector, Document, DocumentStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Everything needed to build one encrypted client.
pub struct EncryptedClientConfig {
    /// Store connection descriptor
    pub connection: ConnectionOptions,
    /// KMS provider the vault's keys are wrapped with
    pub kms: Arc<dyn Kms>,
    /// Key vault namespace
    pub key_vault: Namespace,
    /// Fields to protect in `target`
    pub schema: EncryptionSchema,
    /// Crypto companion agent
    pub crypto_agent: CryptoAgentLocator,
    /// Collection the client reads and writes
    pub target: Namespace,
}

/// Builds encrypted and plain clients over one [`Connector`].
#[derive(Clone)]
pub struct EncryptedClientFactory {
    connector: Arc<dyn Connector>,
}

impl EncryptedClientFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, Error> {
        connect_bounded(&self.connector, options)
            .map_err(|e| Error::ClientConstruction(format!("cannot connect to {}: {e}", options.uri())))
    }

    /// Opens the key vault at `namespace`.
    ///
    /// Connecting and every later vault operation are bounded by the
    /// timeouts in `connection`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyLookup` if the store cannot be reached in time.
    pub fn key_vault(
        &self,
        connection: &ConnectionOptions,
        namespace: Namespace,
    ) -> Result<KeyVaultManager, Error> {
        let store = connect_bounded(&self.connector, connection).map_err(Error::KeyLookup)?;
        Ok(KeyVaultManager::new(store, namespace))
    }

    /// Builds a client that encrypts `config.schema` fields automatically.
    ///
    /// The agent is started first; every key id the schema references must
    /// already exist in the vault.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if the agent cannot be
    /// reached and `Error::ClientConstruction` if the store cannot be
    /// reached or a referenced key is missing.
    pub fn create_encrypted_client(
        &self,
        config: EncryptedClientConfig,
    ) -> Result<EncryptedClient, Error> {
        let EncryptedClientConfig { connection, kms, key_vault, schema, crypto_agent, target } =
            config;

        let agent = agent::launch(&crypto_agent, connection.connect_timeout())?;
        let store = self.connect(&connection)?;
        let vault = KeyVaultManager::new(Arc::clone(&store), key_vault);

        for key_id in schema.key_ids() {
            match vault.load_key(key_id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(Error::ClientConstruction(format!(
                        "schema references key {key_id} which is not in vault {}",
                        vault.namespace()
                    )))
                }
                Err(e) => {
                    return Err(Error::ClientConstruction(format!(
                        "cannot verify key {key_id}: {e}"
                    )))
                }
            }
        }

        debug!(target = %target, fields = schema.len(), agent = %crypto_agent, "encrypted client ready");
        Ok(EncryptedClient {
            store,
            vault,
            kms,
            schema,
            target,
            agent,
            ciphers: Mutex::new(HashMap::new()),
        })
    }

    /// Builds a client that performs no encryption or decryption.
    ///
    /// For verification and inspection only.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClientConstruction` if the store cannot be reached.
    pub fn create_plain_client(
        &self,
        connection: &ConnectionOptions,
        target: Namespace,
    ) -> Result<PlainClient, Error> {
        let store = self.connect(connection)?;
        Ok(PlainClient { store, target })
    }
}

/// Client that encrypts and decrypts schema fields transparently.
pub struct EncryptedClient {
    store: Arc<dyn DocumentStore>,
    vault: KeyVaultManager,
    kms: Arc<dyn Kms>,
    schema: EncryptionSchema,
    target: Namespace,
    agent: Box<dyn CryptoAgent>,
    ciphers: Mutex<HashMap<KeyId, Arc<FieldCipher>>>,
}

impl EncryptedClient {
    /// Returns the collection this client works on.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.target
    }

    /// Returns the schema this client enforces.
    #[must_use]
    pub const fn schema(&self) -> &EncryptionSchema {
        &self.schema
    }

    /// Encrypts protected fields and inserts the document, returning its `_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if the agent is gone,
    /// `Error::Encryption` if a protected value has the wrong type, and
    /// `Error::Store` if the insert fails.
    pub fn insert_one(&self, document: Document) -> Result<Value, Error> {
        self.agent.check()?;

        let mut document = document;
        let id = ensure_id(&mut document);
        self.encrypt_fields(&mut document)?;
        self.store.insert_one(&self.target, document)?;
        debug!(target = %self.target, "inserted document with encrypted fields");
        Ok(id)
    }

    /// Finds one document, rewriting equality on deterministic fields and
    /// decrypting the result.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if the agent is gone,
    /// `Error::UnsupportedQuery` for filters that cannot run over encrypted
    /// fields, and decryption errors for ciphertexts this client cannot open.
    pub fn find_one(&self, filter: &Document) -> Result<Option<Document>, Error> {
        self.agent.check()?;

        let filter = self.rewrite_filter(filter)?;
        let Some(mut document) = self.store.find_one(&self.target, &filter)? else {
            return Ok(None);
        };
        for value in document.values_mut() {
            self.decrypt_value(value)?;
        }
        Ok(Some(document))
    }

    /// Releases the client, its connection and its agent.
    pub fn close(self) {
        debug!(target = %self.target, "closing encrypted client");
    }

    fn encrypt_fields(&self, document: &mut Document) -> Result<(), Error> {
        self.reject_dotted_keys(document, "")?;
        for (path, rule) in self.schema.fields() {
            let Some(slot) = protected_slot(document, path)? else {
                continue;
            };
            if slot.is_null() || Binary::is_encrypted(slot) {
                continue;
            }
            *slot = self.encrypt_value(path, rule, slot)?;
        }
        Ok(())
    }

    /// A literal key such as `"insurance.policyNumber"` would bypass the
    /// path walk, so keys containing dots may not touch a protected path.
    fn reject_dotted_keys(&self, map: &Document, parent: &str) -> Result<(), Error> {
        for (key, value) in map {
            let path = if parent.is_empty() { key.clone() } else { format!("{parent}.{key}") };
            if key.contains('.') && self.schema.overlaps(&path) {
                return Err(Error::Encryption(format!(
                    "key {key:?} addresses protected field {path} with a literal dot"
                )));
            }
            if let Value::Object(child) = value {
                if self.schema.has_protected_descendant(&path) {
                    self.reject_dotted_keys(child, &path)?;
                }
            }
        }
        Ok(())
    }

    fn encrypt_value(&self, path: &str, rule: &FieldRule, value: &Value) -> Result<Value, Error> {
        if let (Some(declared), Some(actual)) = (rule.bson_type, BsonType::of(value)) {
            if !declared.accepts(actual) {
                return Err(Error::Encryption(format!(
                    "field {path} is declared {declared} but holds {actual}"
                )));
            }
        }
        let cipher = self.cipher(rule.key_id)?;
        Ok(cipher.encrypt(value, rule.algorithm)?.to_value())
    }

    fn rewrite_filter(&self, filter: &Document) -> Result<Document, Error> {
        let mut rewritten = Document::with_capacity(filter.len());
        for (path, value) in filter {
            if path.starts_with('$') {
                if self.schema.is_empty() {
                    rewritten.insert(path.clone(), value.clone());
                    continue;
                }
                return Err(Error::UnsupportedQuery(format!(
                    "top-level operator {path} cannot be analyzed against the schema"
                )));
            }
            if self.schema.has_protected_descendant(path) {
                return Err(Error::UnsupportedQuery(format!(
                    "comparison on {path} would compare encrypted sub-fields"
                )));
            }
            if let Some(parent) = self.schema.protected_ancestor(path) {
                return Err(Error::UnsupportedQuery(format!(
                    "{path} lies inside encrypted field {parent}"
                )));
            }
            let Some(rule) = self.schema.rule(path) else {
                rewritten.insert(path.clone(), value.clone());
                continue;
            };
            if rule.algorithm == Algorithm::Random {
                return Err(Error::UnsupportedQuery(format!(
                    "field {path} is encrypted with the random algorithm and cannot be queried"
                )));
            }
            let is_operator = value
                .as_object()
                .is_some_and(|map| map.keys().any(|k| k.starts_with('$')) && !Binary::is_encrypted(value));
            if is_operator {
                return Err(Error::UnsupportedQuery(format!(
                    "only equality is supported on encrypted field {path}"
                )));
            }
            let encrypted = if Binary::is_encrypted(value) {
                value.clone()
            } else {
                self.encrypt_value(path, rule, value)?
            };
            rewritten.insert(path.clone(), encrypted);
        }
        Ok(rewritten)
    }

    fn decrypt_value(&self, value: &mut Value) -> Result<(), Error> {
        if let Some(binary) = Binary::from_value(value) {
            if Binary::is_encrypted(value) {
                let cipher = self.cipher(ciphertext_key_id(&binary)?)?;
                *value = cipher.decrypt(&binary)?;
            }
            return Ok(());
        }
        match value {
            Value::Object(map) => map.values_mut().try_for_each(|v| self.decrypt_value(v)),
            Value::Array(items) => items.iter_mut().try_for_each(|v| self.decrypt_value(v)),
            _ => Ok(()),
        }
    }

    fn cipher(&self, key_id: KeyId) -> Result<Arc<FieldCipher>, Error> {
        if let Some(cipher) = self.lock_ciphers().get(&key_id) {
            return Ok(Arc::clone(cipher));
        }

        let dek = self.vault.unwrap_key(self.kms.as_ref(), key_id)?;
        let cipher = Arc::new(FieldCipher::new(key_id, &dek)?);
        drop(dek);

        Ok(Arc::clone(self.lock_ciphers().entry(key_id).or_insert(cipher)))
    }

    fn lock_ciphers(&self) -> std::sync::MutexGuard<'_, HashMap<KeyId, Arc<FieldCipher>>> {
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves the value at protected `path` for encryption.
///
/// Returns `None` if the document does not hold the path. Arrays on the way
/// are an error: their elements cannot be addressed by the schema, and
/// skipping them would store the value in plaintext.
fn protected_slot<'a>(
    document: &'a mut Document,
    path: &str,
) -> Result<Option<&'a mut Value>, Error> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Ok(None);
    };
    let Some(mut current) = document.get_mut(first) else {
        return Ok(None);
    };
    let mut walked = first.to_string();
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Array(_) => {
                return Err(Error::Encryption(format!(
                    "protected field {path} cannot be written: {walked} is an array"
                )))
            }
            _ => return Ok(None),
        };
        walked.push('.');
        walked.push_str(segment);
    }
    Ok(Some(current))
}

/// Client with no encryption, for inspecting stored documents.
pub struct PlainClient {
    store: Arc<dyn DocumentStore>,
    target: Namespace,
}

impl PlainClient {
    /// Returns the collection this client works on.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.target
    }

    /// Inserts a document as-is.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the insert fails.
    pub fn insert_one(&self, document: Document) -> Result<Value, Error> {
        Ok(self.store.insert_one(&self.target, document)?)
    }

    /// Finds one document and returns it exactly as stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the query fails.
    pub fn find_one(&self, filter: &Document) -> Result<Option<Document>, Error> {
        Ok(self.store.find_one(&self.target, filter)?)
    }

    /// Releases the client.
    pub fn close(self) {
        debug!(target = %self.target, "closing plain client");
    }
}
