//! Bootstrap orchestration.
//!
//! A bootstrap run resolves the data key named in the settings, provisioning
//! it on first run, builds the schema bound to that key and then verifies
//! the setup with a round trip through an encrypted and a plain client.
//!
//! ```text
//! Unresolved -> Lookup -> Ready
//!                     \-> Missing -> Provisioning -> Ready
//!                                              \-> Fatal
//! ```
//!
//! Each stage receives its inputs explicitly and hands its output to the
//! next: key id, then schema, then client. Once the key is `Ready`, failures
//! while building the schema or verifying are reported in the
//! [`BootstrapReport`] and do not undo the key.

use crate::binary::Binary;
use crate::client::{EncryptedClientConfig, EncryptedClientFactory};
use crate::config::Settings;
use crate::error::{Error, StoreError};
use crate::key_vault::{KeyId, KeyVaultManager};
use crate::kms::{Kms, KmsProvider, LocalKms};
use crate::master_key::MasterKeySource;
use crate::schema::{build_schema, Algorithm, EncryptionSchema, FieldSpec};
use crate::store::{ensure_id, lookup_path, Document};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// States of the key lifecycle during a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing has been queried yet
    Unresolved,
    /// Looking the key up by alternate name
    Lookup,
    /// The vault holds no key under the name
    Missing,
    /// Creating the index and the key
    Provisioning,
    /// A key id is known
    Ready,
    /// The key could not be resolved
    Fatal,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unresolved => "unresolved",
            Self::Lookup => "lookup",
            Self::Missing => "missing",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Whether the resolved key already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Found in the vault
    Existing,
    /// Created by this run, or adopted from a concurrent creator
    Provisioned,
}

/// Outcome of key resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolution {
    /// Resolved key id
    pub key_id: KeyId,
    /// Whether provisioning ran
    pub origin: KeyOrigin,
    /// States visited, starting with `Unresolved` and ending with `Ready`
    pub transitions: Vec<BootstrapState>,
}

struct Transitions(Vec<BootstrapState>);

impl Transitions {
    fn new() -> Self {
        Self(vec![BootstrapState::Unresolved])
    }

    fn enter(&mut self, alt_name: &str, state: BootstrapState) {
        let from = self.0.last().copied().unwrap_or(BootstrapState::Unresolved);
        info!(alt_name, %from, to = %state, "bootstrap transition");
        self.0.push(state);
    }

    fn fatal(&mut self, alt_name: &str, error: Error) -> Error {
        self.enter(alt_name, BootstrapState::Fatal);
        error
    }
}

/// Looks `alt_name` up, retrying once if the vault query fails.
///
/// # Errors
///
/// Returns `Error::KeyLookup` if both attempts fail.
pub fn lookup_key(vault: &KeyVaultManager, alt_name: &str) -> Result<Option<KeyId>, Error> {
    match vault.find_key(alt_name) {
        Err(Error::KeyLookup(err)) => {
            warn!(alt_name, "key lookup failed, retrying once: {err}");
            vault.find_key(alt_name)
        }
        other => other,
    }
}

/// Resolves the data key named `alt_name`, provisioning it if absent.
///
/// # Errors
///
/// Returns `Error::KeyLookup` if the vault cannot be queried and
/// `Error::KeyProvisioning` if the index or the key cannot be created. No
/// schema or client should be built after either.
pub fn resolve_key(
    vault: &KeyVaultManager,
    kms: &dyn Kms,
    alt_name: &str,
) -> Result<KeyResolution, Error> {
    let mut transitions = Transitions::new();
    let (key_id, origin) = drive(vault, kms, alt_name, &mut transitions)?;
    Ok(KeyResolution { key_id, origin, transitions: transitions.0 })
}

fn drive(
    vault: &KeyVaultManager,
    kms: &dyn Kms,
    alt_name: &str,
    transitions: &mut Transitions,
) -> Result<(KeyId, KeyOrigin), Error> {
    transitions.enter(alt_name, BootstrapState::Lookup);
    let found = lookup_key(vault, alt_name).map_err(|e| transitions.fatal(alt_name, e))?;

    let resolved = if let Some(key_id) = found {
        (key_id, KeyOrigin::Existing)
    } else {
        transitions.enter(alt_name, BootstrapState::Missing);
        transitions.enter(alt_name, BootstrapState::Provisioning);
        let key_id = vault
            .ensure_index()
            .and_then(|()| vault.create_key(kms, alt_name))
            .map_err(|e| transitions.fatal(alt_name, e))?;
        (key_id, KeyOrigin::Provisioned)
    };

    transitions.enter(alt_name, BootstrapState::Ready);
    Ok(resolved)
}

/// A protected field as seen through both clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedField {
    /// Field path
    pub path: String,
    /// Value written through the encrypted client
    pub plaintext: Value,
    /// Raw bytes stored in the collection
    pub ciphertext: Vec<u8>,
}

impl ProtectedField {
    /// Whether the stored bytes neither equal nor contain the plaintext.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        let needle = match &self.plaintext {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        };
        if needle.is_empty() {
            return self.ciphertext != needle;
        }
        !self.ciphertext.windows(needle.len()).any(|window| window == needle.as_slice())
    }
}

/// Result of the verification round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    /// `_id` of the inserted document
    pub inserted_id: Value,
    /// Document as read through the encrypted client
    pub decrypted: Document,
    /// Document as read through the plain client
    pub stored: Document,
    /// Protected fields of the sample
    pub protected: Vec<ProtectedField>,
}

impl VerificationReport {
    /// Whether every protected field is stored opaquely.
    #[must_use]
    pub fn all_protected_opaque(&self) -> bool {
        self.protected.iter().all(ProtectedField::is_opaque)
    }
}

/// Result of a bootstrap run that reached `Ready`.
#[derive(Debug)]
pub struct BootstrapReport {
    /// Key resolution
    pub key: KeyResolution,
    /// Schema bound to the key, unless building it failed
    pub schema: Option<EncryptionSchema>,
    /// Outcome of the round trip
    pub verification: Result<VerificationReport, Error>,
}

/// Runs the bootstrap stages for one set of settings.
pub struct Bootstrap {
    settings: Settings,
    factory: EncryptedClientFactory,
}

impl Bootstrap {
    /// Creates a bootstrap over `settings`, connecting through `factory`.
    #[must_use]
    pub const fn new(settings: Settings, factory: EncryptedClientFactory) -> Self {
        Self { settings, factory }
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds the local KMS provider from the master key file.
    ///
    /// Runs before any database operation, so a bad key leaves no trace.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if the master key file is unreadable,
    /// empty or of the wrong length, and `Error::Config` if the settings
    /// select another provider.
    pub fn local_kms(&self) -> Result<LocalKms, Error> {
        match self.settings.kms_provider() {
            KmsProvider::Local { master_key_file } => {
                LocalKms::new(MasterKeySource::local().read(master_key_file)?)
            }
            other => Err(Error::Config(format!(
                "KMS provider {} does not use a local master key",
                other.kind()
            ))),
        }
    }

    /// Opens the key vault named in the settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyLookup` if the store cannot be reached.
    pub fn vault(&self) -> Result<KeyVaultManager, Error> {
        self.factory.key_vault(self.settings.connection(), self.settings.key_vault().clone())
    }

    /// Resolves the configured key, provisioning it if needed.
    ///
    /// # Errors
    ///
    /// See [`resolve_key`].
    pub fn resolve(&self, kms: &dyn Kms) -> Result<KeyResolution, Error> {
        let vault = self.vault()?;
        resolve_key(&vault, kms, self.settings.key_alt_name())
    }

    /// Builds the schema for the configured key without provisioning.
    ///
    /// Returns `None` if the vault holds no such key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyLookup` if the vault cannot be queried and
    /// `Error::SchemaBuild` if the field specs are invalid.
    pub fn existing_schema(&self, fields: &[FieldSpec]) -> Result<Option<EncryptionSchema>, Error> {
        let vault = self.vault()?;
        lookup_key(&vault, self.settings.key_alt_name())?
            .map(|key_id| build_schema(key_id, fields))
            .transpose()
    }

    /// Resolves the key, builds the schema and verifies it with `sample`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the key cannot be resolved. Later failures
    /// are reported in [`BootstrapReport`].
    pub fn run(
        &self,
        kms: Arc<dyn Kms>,
        fields: &[FieldSpec],
        sample: Document,
    ) -> Result<BootstrapReport, Error> {
        let key = self.resolve(kms.as_ref())?;

        let schema = match build_schema(key.key_id, fields) {
            Ok(schema) => schema,
            Err(e) => {
                warn!(key_id = %key.key_id, "schema build failed: {e}");
                return Ok(BootstrapReport { key, schema: None, verification: Err(e) });
            }
        };
        info!(key_id = %key.key_id, fields = schema.len(), "built encryption schema");

        let verification = self.verify(kms, &schema, sample);
        match &verification {
            Ok(report) => info!(
                protected = report.protected.len(),
                opaque = report.all_protected_opaque(),
                "verification round trip complete"
            ),
            Err(e) => warn!("verification failed: {e}"),
        }
        Ok(BootstrapReport { key, schema: Some(schema), verification })
    }

    /// Writes `sample` through an encrypted client and reads it back through
    /// both an encrypted and a plain client.
    ///
    /// # Errors
    ///
    /// Returns the first client or store error, and `Error::Encryption` if a
    /// protected field is stored in plaintext.
    pub fn verify(
        &self,
        kms: Arc<dyn Kms>,
        schema: &EncryptionSchema,
        sample: Document,
    ) -> Result<VerificationReport, Error> {
        let settings = &self.settings;
        let client = self.factory.create_encrypted_client(EncryptedClientConfig {
            connection: settings.connection().clone(),
            kms,
            key_vault: settings.key_vault().clone(),
            schema: schema.clone(),
            crypto_agent: settings.crypto_agent().clone(),
            target: settings.target().clone(),
        })?;
        let plain =
            self.factory.create_plain_client(settings.connection(), settings.target().clone())?;

        let mut sample = sample;
        let inserted_id = ensure_id(&mut sample);
        client.insert_one(sample.clone())?;

        let mut filter = Document::new();
        filter.insert("_id".to_string(), inserted_id.clone());
        let by_id = filter.clone();
        let queried = schema.fields().find_map(|(path, rule)| {
            let value = lookup_path(&sample, path).filter(|v| !v.is_null())?;
            (rule.algorithm == Algorithm::Deterministic).then(|| (path.to_string(), value.clone()))
        });
        if let Some((path, value)) = queried {
            filter.insert(path, value);
        }

        let not_found = || {
            Error::Store(StoreError::InvalidDocument(format!(
                "document {inserted_id} not found after insert"
            )))
        };
        let decrypted = client.find_one(&filter)?.ok_or_else(not_found)?;
        let stored = plain.find_one(&by_id)?.ok_or_else(not_found)?;

        let mut protected = Vec::new();
        for (path, _) in schema.fields() {
            let Some(plaintext) = lookup_path(&sample, path).filter(|v| !v.is_null()) else {
                continue;
            };
            let ciphertext = lookup_path(&stored, path)
                .filter(|v| Binary::is_encrypted(v))
                .and_then(Binary::from_value)
                .ok_or_else(|| Error::Encryption(format!("field {path} was stored in plaintext")))?;
            protected.push(ProtectedField {
                path: path.to_string(),
                plaintext: plaintext.clone(),
                ciphertext: ciphertext.into_bytes(),
            });
        }

        client.close();
        plain.close();
        Ok(VerificationReport { inserted_id, decrypted, stored, protected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KmsError, ProvisioningCause};
    use crate::kms::{KmsProviderKind, MasterKeyDescriptor};
    use crate::memory::MemoryStore;
    use crate::namespace::Namespace;
    use crate::store::DocumentStore;
    use secrecy::SecretVec;
    use serde_json::json;
    use std::io::Write;
    use std::net::TcpListener;
    use tempfile::NamedTempFile;

    fn vault(store: &MemoryStore) -> KeyVaultManager {
        KeyVaultManager::new(Arc::new(store.clone()), Namespace::new("encryption", "__keyVault").unwrap())
    }

    fn kms() -> LocalKms {
        LocalKms::new(crate::master_key::MasterKeyMaterial::new(vec![3u8; 96], 96).unwrap()).unwrap()
    }

    #[test]
    fn test_first_run_provisions() {
        let store = MemoryStore::new();
        let resolution = resolve_key(&vault(&store), &kms(), "demo-data-key").unwrap();
        assert_eq!(resolution.origin, KeyOrigin::Provisioned);
        assert_eq!(
            resolution.transitions,
            vec![
                BootstrapState::Unresolved,
                BootstrapState::Lookup,
                BootstrapState::Missing,
                BootstrapState::Provisioning,
                BootstrapState::Ready,
            ]
        );
    }

    #[test]
    fn test_second_run_reuses() {
        let store = MemoryStore::new();
        let first = resolve_key(&vault(&store), &kms(), "demo-data-key").unwrap();
        let second = resolve_key(&vault(&store), &kms(), "demo-data-key").unwrap();
        assert_eq!(first.key_id, second.key_id);
        assert_eq!(second.origin, KeyOrigin::Existing);
        assert_eq!(
            second.transitions,
            vec![BootstrapState::Unresolved, BootstrapState::Lookup, BootstrapState::Ready]
        );
    }

    #[test]
    fn test_lookup_retried_once() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let resolution = resolve_key(&vault(&store), &kms(), "demo-data-key").unwrap();
        assert_eq!(resolution.origin, KeyOrigin::Provisioned);
    }

    #[test]
    fn test_persistent_lookup_failure_is_fatal() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let result = resolve_key(&vault(&store), &kms(), "demo-data-key");
        assert!(matches!(result, Err(Error::KeyLookup(_))));
        assert_eq!(store.count(&Namespace::new("encryption", "__keyVault").unwrap()), 0);
    }

    #[test]
    fn test_vault_failure_during_provisioning_is_fatal() {
        let store = MemoryStore::new();
        let vault = vault(&store);
        // two keys sharing a name make the unique index impossible to build
        for _ in 0..2 {
            let mut doc = Document::new();
            doc.insert("keyAltNames".to_string(), json!(["legacy"]));
            store.insert_one(vault.namespace(), doc).unwrap();
        }

        let result = resolve_key(&vault, &kms(), "demo-data-key");
        assert!(matches!(result, Err(Error::KeyProvisioning(_))));
        assert_eq!(lookup_key(&vault, "demo-data-key").unwrap(), None);
    }

    struct OfflineKms;

    impl Kms for OfflineKms {
        fn kind(&self) -> KmsProviderKind {
            KmsProviderKind::Local
        }

        fn master_key(&self) -> MasterKeyDescriptor {
            MasterKeyDescriptor::Local
        }

        fn wrap_dek(&self, _: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
            Err(KmsError::Unavailable("provider offline".to_string()))
        }

        fn unwrap_dek(&self, _: &MasterKeyDescriptor, _: &[u8]) -> Result<SecretVec<u8>, KmsError> {
            Err(KmsError::Unavailable("provider offline".to_string()))
        }
    }

    #[test]
    fn test_kms_failure_during_provisioning_is_fatal() {
        let store = MemoryStore::new();
        let vault = vault(&store);
        let mut transitions = Transitions::new();

        let result = drive(&vault, &OfflineKms, "demo-data-key", &mut transitions);
        assert!(matches!(result, Err(Error::KeyProvisioning(ProvisioningCause::Kms(_)))));
        assert_eq!(
            transitions.0,
            vec![
                BootstrapState::Unresolved,
                BootstrapState::Lookup,
                BootstrapState::Missing,
                BootstrapState::Provisioning,
                BootstrapState::Fatal,
            ]
        );
        assert_eq!(store.count(vault.namespace()), 0);

        let result = resolve_key(&vault, &OfflineKms, "demo-data-key");
        assert!(matches!(result, Err(Error::KeyProvisioning(ProvisioningCause::Kms(_)))));
    }

    #[test]
    fn test_protected_field_opacity() {
        let field = ProtectedField {
            path: "ssn".to_string(),
            plaintext: json!("123-45-6789"),
            ciphertext: b"xx123-45-6789yy".to_vec(),
        };
        assert!(!field.is_opaque());

        let field = ProtectedField { ciphertext: vec![1, 2, 3, 4], ..field };
        assert!(field.is_opaque());
    }

    #[test]
    fn test_run_end_to_end() {
        let store = MemoryStore::new();
        let agent = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(&[9u8; 96]).unwrap();

        let vars: std::collections::HashMap<&str, String> = [
            ("CONNECTION", "memory://demo".to_string()),
            ("DATABASE", "medicalRecords".to_string()),
            ("COLLECTION", "patients".to_string()),
            ("KEY_DB", "encryption".to_string()),
            ("KEY_COLLECTION", "__keyVault".to_string()),
            ("KMS_PROVIDER", "local".to_string()),
            ("KEY_ALT_NAME", "demo-data-key".to_string()),
            ("MASTER_KEY_FILE", key_file.path().display().to_string()),
            ("MONGO_CRYPTD_PATH", format!("tcp://{}", agent.local_addr().unwrap())),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|k| vars.get(k).cloned()).unwrap();

        let bootstrap = Bootstrap::new(settings, EncryptedClientFactory::new(Arc::new(store)));
        let kms: Arc<dyn Kms> = Arc::new(bootstrap.local_kms().unwrap());
        let fields = [
            FieldSpec::new("ssn", "deterministic").with_bson_type("string"),
            FieldSpec::new("prescription", "random").with_bson_type("string"),
        ];
        let sample = json!({"name": "Jon Doe", "ssn": "123-45-6789", "prescription": "Lisinopril"})
            .as_object()
            .cloned()
            .unwrap();

        let report = bootstrap.run(kms, &fields, sample).unwrap();
        let verification = report.verification.unwrap();
        assert_eq!(verification.decrypted["ssn"], "123-45-6789");
        assert_eq!(verification.protected.len(), 2);
        assert!(verification.all_protected_opaque());
        assert!(Binary::is_encrypted(&verification.stored["ssn"]));
    }

    #[test]
    fn test_bad_schema_keeps_key() {
        let store = MemoryStore::new();
        let agent = TcpListener::bind("127.0.0.1:0").unwrap();
        let vars: std::collections::HashMap<&str, String> = [
            ("CONNECTION", "memory://demo".to_string()),
            ("DATABASE", "medicalRecords".to_string()),
            ("COLLECTION", "patients".to_string()),
            ("KEY_DB", "encryption".to_string()),
            ("KEY_COLLECTION", "__keyVault".to_string()),
            ("KMS_PROVIDER", "local".to_string()),
            ("KEY_ALT_NAME", "demo-data-key".to_string()),
            ("MASTER_KEY_FILE", "unused".to_string()),
            ("MONGO_CRYPTD_PATH", format!("tcp://{}", agent.local_addr().unwrap())),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let bootstrap = Bootstrap::new(settings, EncryptedClientFactory::new(Arc::new(store.clone())));

        let report = bootstrap
            .run(Arc::new(kms()), &[FieldSpec::new("ssn", "rot13")], Document::new())
            .unwrap();
        assert!(report.schema.is_none());
        assert!(matches!(report.verification, Err(Error::SchemaBuild(_))));
        assert_eq!(lookup_key(&vault(&store), "demo-data-key").unwrap(), Some(report.key.key_id));
    }
}
