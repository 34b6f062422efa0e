//! Immutable settings for a bootstrap run.
//!
//! Settings are read once, validated in full, and then passed by reference
//! into each stage. Nothing touches the database until every required value
//! is present.

use crate::agent::CryptoAgentLocator;
use crate::error::Error;
use crate::kms::{AwsCredentials, AwsMasterKey, KmsProvider, KmsProviderKind};
use crate::namespace::Namespace;
use crate::schema::FieldSpec;
use crate::store::{ConnectionOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection descriptor of the document store.
pub const CONNECTION: &str = "CONNECTION";
/// Target database.
pub const DATABASE: &str = "DATABASE";
/// Target collection.
pub const COLLECTION: &str = "COLLECTION";
/// Key vault database.
pub const KEY_DB: &str = "KEY_DB";
/// Key vault collection.
pub const KEY_COLLECTION: &str = "KEY_COLLECTION";
/// KMS provider tag.
pub const KMS_PROVIDER: &str = "KMS_PROVIDER";
/// Alternate name of the data key.
pub const KEY_ALT_NAME: &str = "KEY_ALT_NAME";
/// Local master key file.
pub const MASTER_KEY_FILE: &str = "MASTER_KEY_FILE";
/// Crypto agent path or `tcp://` endpoint.
pub const MONGO_CRYPTD_PATH: &str = "MONGO_CRYPTD_PATH";
/// Optional `path:algorithm[:bsonType]` list.
pub const ENCRYPTED_FIELDS: &str = "ENCRYPTED_FIELDS";
/// Optional connect timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "CONNECT_TIMEOUT_MS";
/// Optional operation timeout in milliseconds.
pub const OPERATION_TIMEOUT_MS: &str = "OPERATION_TIMEOUT_MS";

const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const AWS_REGION: &str = "AWS_REGION";
const AWS_KEY_ARN: &str = "AWS_KEY_ARN";

/// Validated settings for one bootstrap run.
#[derive(Debug, Clone)]
pub struct Settings {
    connection: ConnectionOptions,
    target: Namespace,
    key_vault: Namespace,
    kms_provider: KmsProvider,
    master_key_file: PathBuf,
    key_alt_name: String,
    crypto_agent: CryptoAgentLocator,
    encrypted_fields: Option<Vec<FieldSpec>>,
}

impl Settings {
    /// Builds settings from a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first missing, empty or malformed
    /// variable.
    ///
    /// # Example
    ///
    /// ```
    /// use csfle::config::Settings;
    /// use std::collections::HashMap;
    ///
    /// let vars: HashMap<&str, &str> = [
    ///     ("CONNECTION", "memory://demo"),
    ///     ("DATABASE", "medicalRecords"),
    ///     ("COLLECTION", "patients"),
    ///     ("KEY_DB", "encryption"),
    ///     ("KEY_COLLECTION", "__keyVault"),
    ///     ("KMS_PROVIDER", "local"),
    ///     ("KEY_ALT_NAME", "demo-data-key"),
    ///     ("MASTER_KEY_FILE", "master-key.txt"),
    ///     ("MONGO_CRYPTD_PATH", "tcp://127.0.0.1:27020"),
    /// ]
    /// .into_iter()
    /// .collect();
    ///
    /// let settings = Settings::from_lookup(|k| vars.get(k).map(ToString::to_string))?;
    /// assert_eq!(settings.key_vault().to_string(), "encryption.__keyVault");
    /// # Ok::<(), csfle::error::Error>(())
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, Error> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("{name} must be set to a non-empty value")))
        };
        let optional = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let uri = required(CONNECTION)?;
        let database = required(DATABASE)?;
        let collection = required(COLLECTION)?;
        let key_db = required(KEY_DB)?;
        let key_collection = required(KEY_COLLECTION)?;
        let provider = required(KMS_PROVIDER)?;
        let key_alt_name = required(KEY_ALT_NAME)?;
        let master_key_file = PathBuf::from(required(MASTER_KEY_FILE)?);
        let crypto_agent = required(MONGO_CRYPTD_PATH)?;

        let connect_timeout =
            timeout(CONNECT_TIMEOUT_MS, optional(CONNECT_TIMEOUT_MS))?.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let operation_timeout = timeout(OPERATION_TIMEOUT_MS, optional(OPERATION_TIMEOUT_MS))?
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT);
        let connection = ConnectionOptions::new(uri)
            .with_connect_timeout(connect_timeout)
            .with_operation_timeout(operation_timeout);

        let target = Namespace::new(database, collection).map_err(|e| named(DATABASE, &e))?;
        let key_vault = Namespace::new(key_db, key_collection).map_err(|e| named(KEY_DB, &e))?;

        let kms_provider = match provider.parse::<KmsProviderKind>()? {
            KmsProviderKind::Local => KmsProvider::Local { master_key_file: master_key_file.clone() },
            KmsProviderKind::Aws => KmsProvider::Aws {
                credentials: AwsCredentials {
                    access_key_id: required(AWS_ACCESS_KEY_ID)?,
                    secret_access_key: SecretString::new(required(AWS_SECRET_ACCESS_KEY)?),
                    session_token: optional(AWS_SESSION_TOKEN).map(SecretString::new),
                },
                master_key: AwsMasterKey {
                    region: required(AWS_REGION)?,
                    key_arn: required(AWS_KEY_ARN)?,
                },
            },
        };

        let crypto_agent = crypto_agent
            .parse::<CryptoAgentLocator>()
            .map_err(|e| named(MONGO_CRYPTD_PATH, &e))?;

        let encrypted_fields = optional(ENCRYPTED_FIELDS)
            .map(|specs| FieldSpec::parse_list(&specs))
            .transpose()
            .map_err(|e| named(ENCRYPTED_FIELDS, &e))?;

        Ok(Self {
            connection,
            target,
            key_vault,
            kms_provider,
            master_key_file,
            key_alt_name,
            crypto_agent,
            encrypted_fields,
        })
    }

    /// Builds settings from the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`Settings::from_lookup`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Store connection options.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionOptions {
        &self.connection
    }

    /// Collection holding application documents.
    #[must_use]
    pub const fn target(&self) -> &Namespace {
        &self.target
    }

    /// Key vault namespace.
    #[must_use]
    pub const fn key_vault(&self) -> &Namespace {
        &self.key_vault
    }

    /// Selected KMS provider and its credentials.
    #[must_use]
    pub const fn kms_provider(&self) -> &KmsProvider {
        &self.kms_provider
    }

    /// Local master key file.
    #[must_use]
    pub fn master_key_file(&self) -> &Path {
        &self.master_key_file
    }

    /// Alternate name of the data key.
    #[must_use]
    pub fn key_alt_name(&self) -> &str {
        &self.key_alt_name
    }

    /// Crypto agent location.
    #[must_use]
    pub const fn crypto_agent(&self) -> &CryptoAgentLocator {
        &self.crypto_agent
    }

    /// Field specs from `ENCRYPTED_FIELDS`, if set.
    #[must_use]
    pub fn encrypted_fields(&self) -> Option<&[FieldSpec]> {
        self.encrypted_fields.as_deref()
    }
}

fn timeout(name: &str, value: Option<String>) -> Result<Option<Duration>, Error> {
    value
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| Error::Config(format!("{name} must be a number of milliseconds: {e}")))
        })
        .transpose()
}

fn named(name: &str, error: &Error) -> Error {
    match error {
        Error::Config(msg) | Error::SchemaBuild(msg) => Error::Config(format!("{name}: {msg}")),
        other => Error::Config(format!("{name}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, String> {
        [
            (CONNECTION, "memory://demo"),
            (DATABASE, "medicalRecords"),
            (COLLECTION, "patients"),
            (KEY_DB, "encryption"),
            (KEY_COLLECTION, "__keyVault"),
            (KMS_PROVIDER, "local"),
            (KEY_ALT_NAME, "demo-data-key"),
            (MASTER_KEY_FILE, "master-key.txt"),
            (MONGO_CRYPTD_PATH, "/usr/local/bin/mongocryptd"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Settings, Error> {
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_local_settings() {
        let settings = load(&base()).unwrap();
        assert_eq!(settings.target().to_string(), "medicalRecords.patients");
        assert_eq!(settings.key_alt_name(), "demo-data-key");
        assert_eq!(settings.connection().connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert!(matches!(settings.kms_provider(), KmsProvider::Local { master_key_file } if master_key_file == Path::new("master-key.txt")));
        assert!(matches!(settings.crypto_agent(), CryptoAgentLocator::Path(_)));
        assert!(settings.encrypted_fields().is_none());
    }

    #[test]
    fn test_every_required_variable_is_checked() {
        for name in [
            CONNECTION,
            DATABASE,
            COLLECTION,
            KEY_DB,
            KEY_COLLECTION,
            KMS_PROVIDER,
            KEY_ALT_NAME,
            MASTER_KEY_FILE,
            MONGO_CRYPTD_PATH,
        ] {
            let mut vars = base();
            vars.remove(name);
            match load(&vars) {
                Err(Error::Config(msg)) => assert!(msg.contains(name), "{msg}"),
                other => panic!("expected config error for {name}, got {other:?}"),
            }

            let mut vars = base();
            vars.insert(name, "   ".to_string());
            assert!(matches!(load(&vars), Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_unknown_provider() {
        let mut vars = base();
        vars.insert(KMS_PROVIDER, "gcp".to_string());
        assert!(matches!(load(&vars), Err(Error::Config(_))));
    }

    #[test]
    fn test_aws_requires_credentials() {
        let mut vars = base();
        vars.insert(KMS_PROVIDER, "aws".to_string());
        assert!(matches!(load(&vars), Err(Error::Config(msg)) if msg.contains(AWS_ACCESS_KEY_ID)));

        vars.insert(AWS_ACCESS_KEY_ID, "AKIAEXAMPLE".to_string());
        vars.insert(AWS_SECRET_ACCESS_KEY, "secret".to_string());
        vars.insert(AWS_REGION, "eu-central-1".to_string());
        vars.insert(AWS_KEY_ARN, "arn:aws:kms:eu-central-1:111122223333:key/demo".to_string());
        let settings = load(&vars).unwrap();
        match settings.kms_provider() {
            KmsProvider::Aws { credentials, master_key } => {
                assert_eq!(credentials.access_key_id, "AKIAEXAMPLE");
                assert!(credentials.session_token.is_none());
                assert_eq!(master_key.region, "eu-central-1");
            }
            KmsProvider::Local { .. } => panic!("expected aws provider"),
        }
    }

    #[test]
    fn test_optional_values() {
        let mut vars = base();
        vars.insert(CONNECT_TIMEOUT_MS, "250".to_string());
        vars.insert(MONGO_CRYPTD_PATH, "tcp://localhost:27020".to_string());
        vars.insert(ENCRYPTED_FIELDS, "ssn:deterministic:string, prescription:random".to_string());
        let settings = load(&vars).unwrap();
        assert_eq!(settings.connection().connect_timeout(), Duration::from_millis(250));
        assert_eq!(settings.connection().operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(settings.crypto_agent(), &CryptoAgentLocator::Endpoint("localhost:27020".to_string()));
        assert_eq!(settings.encrypted_fields().map(<[FieldSpec]>::len), Some(2));

        vars.insert(OPERATION_TIMEOUT_MS, "soon".to_string());
        assert!(matches!(load(&vars), Err(Error::Config(msg)) if msg.contains(OPERATION_TIMEOUT_MS)));
    }

    #[test]
    fn test_malformed_field_list() {
        let mut vars = base();
        vars.insert(ENCRYPTED_FIELDS, "ssn".to_string());
        assert!(matches!(load(&vars), Err(Error::Config(msg)) if msg.contains(ENCRYPTED_FIELDS)));
    }
}
