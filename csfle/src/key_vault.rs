//! Data encryption keys and the vault that holds them.
//!
//! Keys are looked up by alternate name. The vault's unique index on
//! `keyAltNames` is the only serialization point between processes that
//! provision the same key concurrently: the loser of the race sees a
//! duplicate-key error and adopts the winner's key.

use crate::binary::{Binary, SUBTYPE_GENERIC, SUBTYPE_UUID};
use crate::error::{Error, ProvisioningCause, StoreError};
use crate::kdf::generate_dek;
use crate::kms::{Kms, MasterKeyDescriptor};
use crate::namespace::Namespace;
use crate::store::{Document, DocumentStore, IndexOutcome};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::SecretVec;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Field carrying a key's alternate names; covered by the unique index.
pub const ALT_NAMES_FIELD: &str = "keyAltNames";

/// Status value of an active key.
pub const STATUS_ACTIVE: i64 = 0;

/// Opaque data key identifier (a UUID).
///
/// Displayed as the base64 encoding of the UUID bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Generates a fresh random key id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Builds a key id from raw UUID bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw UUID bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Renders the id as an extended JSON UUID binary.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Binary::new(SUBTYPE_UUID, self.as_bytes().to_vec()).to_value()
    }

    /// Parses an extended JSON UUID binary.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let binary = Binary::from_value(value)?;
        if binary.subtype() != SUBTYPE_UUID {
            return None;
        }
        let bytes: [u8; 16] = binary.bytes().try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.as_bytes()))
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::Config(format!("key id is not base64: {e}")))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::Config("key id must encode 16 bytes".to_string()))?;
        Ok(Self::from_bytes(bytes))
    }
}

/// A wrapped data encryption key as stored in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    /// Key identifier
    pub id: KeyId,
    /// Alternate names (unique across the vault)
    pub alt_names: Vec<String>,
    /// DEK wrapped by the KMS provider
    pub key_material: Vec<u8>,
    /// Master key the DEK is wrapped under
    pub master_key: MasterKeyDescriptor,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Key status (`0` = active)
    pub status: i64,
}

impl DataKey {
    /// Filter selecting a key by alternate name.
    #[must_use]
    pub fn alt_name_filter(alt_name: &str) -> Document {
        let mut filter = Document::new();
        filter.insert(ALT_NAMES_FIELD.to_string(), json!(alt_name));
        filter
    }

    /// Filter selecting a key by id.
    #[must_use]
    pub fn id_filter(id: KeyId) -> Document {
        let mut filter = Document::new();
        filter.insert("_id".to_string(), id.to_value());
        filter
    }

    /// Serializes the key into its vault document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if the master key descriptor
    /// cannot be serialized.
    pub fn to_document(&self) -> Result<Document, StoreError> {
        let mut document = Document::new();
        document.insert("_id".to_string(), self.id.to_value());
        document.insert(ALT_NAMES_FIELD.to_string(), json!(self.alt_names));
        document.insert(
            "keyMaterial".to_string(),
            Binary::new(SUBTYPE_GENERIC, self.key_material.clone()).to_value(),
        );
        document.insert("creationDate".to_string(), date_value(self.created_at));
        document.insert("updateDate".to_string(), date_value(self.updated_at));
        document.insert("status".to_string(), json!(self.status));
        document.insert("masterKey".to_string(), serde_json::to_value(&self.master_key)?);
        Ok(document)
    }

    /// Parses a vault document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidDocument` if a field is missing or malformed.
    pub fn from_document(document: &Document) -> Result<Self, StoreError> {
        let invalid = |field: &str| StoreError::InvalidDocument(format!("data key field {field}"));

        let id = document.get("_id").and_then(KeyId::from_value).ok_or_else(|| invalid("_id"))?;
        let alt_names = match document.get(ALT_NAMES_FIELD) {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|_| invalid(ALT_NAMES_FIELD))?,
        };
        let key_material = document
            .get("keyMaterial")
            .and_then(Binary::from_value)
            .map(Binary::into_bytes)
            .ok_or_else(|| invalid("keyMaterial"))?;
        let master_key = document
            .get("masterKey")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| invalid("masterKey"))?;
        let created_at =
            document.get("creationDate").and_then(parse_date).ok_or_else(|| invalid("creationDate"))?;
        let updated_at =
            document.get("updateDate").and_then(parse_date).ok_or_else(|| invalid("updateDate"))?;
        let status = document.get("status").and_then(Value::as_i64).unwrap_or(STATUS_ACTIVE);

        Ok(Self { id, alt_names, key_material, master_key, created_at, updated_at, status })
    }
}

fn date_value(at: DateTime<Utc>) -> Value {
    json!({ "$date": at.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_object()?.get("$date")?.as_str()?;
    DateTime::parse_from_rfc3339(text).ok().map(|at| at.with_timezone(&Utc))
}

/// Finds and provisions data keys in one vault namespace.
#[derive(Clone)]
pub struct KeyVaultManager {
    store: Arc<dyn DocumentStore>,
    namespace: Namespace,
}

impl KeyVaultManager {
    /// Creates a manager for the vault at `namespace`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    /// Returns the vault namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Looks up the key with alternate name `alt_name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyLookup` if the vault cannot be queried or holds a
    /// malformed key document. Callers may retry once.
    pub fn find_key(&self, alt_name: &str) -> Result<Option<KeyId>, Error> {
        let found = self
            .store
            .find_one(&self.namespace, &DataKey::alt_name_filter(alt_name))
            .map_err(Error::KeyLookup)?;
        match found {
            None => {
                debug!(alt_name, vault = %self.namespace, "no data key found");
                Ok(None)
            }
            Some(document) => {
                let key = DataKey::from_document(&document).map_err(Error::KeyLookup)?;
                debug!(alt_name, key_id = %key.id, "found data key");
                Ok(Some(key.id))
            }
        }
    }

    /// Ensures the unique index on alternate names exists.
    ///
    /// An index that already exists counts as success.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyProvisioning` if the index cannot be built.
    pub fn ensure_index(&self) -> Result<(), Error> {
        match self.store.create_unique_index(&self.namespace, ALT_NAMES_FIELD) {
            Ok(IndexOutcome::Created) => {
                info!(vault = %self.namespace, "created unique index on {ALT_NAMES_FIELD}");
                Ok(())
            }
            Ok(IndexOutcome::AlreadyExists) => {
                debug!(vault = %self.namespace, "unique index on {ALT_NAMES_FIELD} already exists");
                Ok(())
            }
            Err(err) => Err(ProvisioningCause::Vault(err).into()),
        }
    }

    /// Generates a DEK, wraps it with `kms` and stores it under `alt_name`.
    ///
    /// Call only after [`find_key`](Self::find_key) returned `None`. If another
    /// process stored a key under the same name in the meantime, the unique
    /// index rejects this one and the winner's id is returned instead.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyProvisioning` if the KMS provider fails, the vault
    /// rejects the key for any reason other than the name conflict, or the
    /// conflicting key cannot be found. Returns `Error::KeyLookup` if the
    /// re-lookup after a conflict fails.
    pub fn create_key(&self, kms: &dyn Kms, alt_name: &str) -> Result<KeyId, Error> {
        if alt_name.is_empty() {
            return Err(Error::Config("key alternate name must not be empty".to_string()));
        }

        let dek = generate_dek();
        let key_material = kms.wrap_dek(&dek).map_err(ProvisioningCause::Kms)?;
        drop(dek);

        let now = Utc::now();
        let key = DataKey {
            id: KeyId::generate(),
            alt_names: vec![alt_name.to_string()],
            key_material,
            master_key: kms.master_key(),
            created_at: now,
            updated_at: now,
            status: STATUS_ACTIVE,
        };
        let document = key.to_document().map_err(ProvisioningCause::Vault)?;

        match self.store.insert_one(&self.namespace, document) {
            Ok(_) => {
                info!(key_id = %key.id, alt_name, provider = %kms.kind(), "created data encryption key");
                Ok(key.id)
            }
            Err(err) if err.is_duplicate_key() => {
                warn!(alt_name, "data key was provisioned concurrently, adopting existing key");
                self.find_key(alt_name)?.ok_or_else(|| {
                    ProvisioningCause::UnresolvedConflict(alt_name.to_string()).into()
                })
            }
            Err(err) => Err(ProvisioningCause::Vault(err).into()),
        }
    }

    /// Loads the full key document for `id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the vault cannot be queried or the document
    /// is malformed.
    pub fn load_key(&self, id: KeyId) -> Result<Option<DataKey>, Error> {
        self.store
            .find_one(&self.namespace, &DataKey::id_filter(id))?
            .map(|document| DataKey::from_document(&document))
            .transpose()
            .map_err(Error::Store)
    }

    /// Loads key `id` and unwraps its DEK with `kms`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the vault has no such key and
    /// `Error::Kms` if the DEK cannot be unwrapped.
    pub fn unwrap_key(&self, kms: &dyn Kms, id: KeyId) -> Result<SecretVec<u8>, Error> {
        let key = self.load_key(id)?.ok_or(Error::KeyNotFound(id))?;
        Ok(kms.unwrap_dek(&key.master_key, &key.key_material)?)
    }
}
