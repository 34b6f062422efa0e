//! Error types for `csfle` operations.

use crate::key_vault::KeyId;
use std::fmt;
use std::time::Duration;

/// Main error type for key lifecycle and encrypted client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required setting is missing, empty or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// Master key material is unreadable, empty or of the wrong length
    #[error("master key material error: {0}")]
    KeyMaterial(String),

    /// The key vault could not be queried
    #[error("key lookup failed: {0}")]
    KeyLookup(#[source] StoreError),

    /// A data encryption key could not be provisioned
    #[error("key provisioning failed: {0}")]
    KeyProvisioning(#[from] ProvisioningCause),

    /// Field specs could not be turned into an encryption schema
    #[error("schema build failed: {0}")]
    SchemaBuild(String),

    /// A client could not be assembled or connected
    #[error("client construction failed: {0}")]
    ClientConstruction(String),

    /// The crypto companion agent is not reachable; nothing is written
    #[error("crypto agent unavailable: {0}")]
    CryptoAgentUnavailable(String),

    /// Field encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Field decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Authentication tag verification failed (data may be corrupted or tampered)
    #[error("authentication failed: ciphertext may be corrupted or tampered")]
    AuthenticationFailed,

    /// The query cannot be expressed over encrypted fields
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    /// A ciphertext references a data key the vault does not hold
    #[error("data key not found in vault: {0}")]
    KeyNotFound(KeyId),

    /// Key provider operation failed outside of provisioning
    #[error("key provider error: {0}")]
    Kms(#[from] KmsError),

    /// Document store operation failed
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
}

/// Underlying cause of a failed key provisioning attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningCause {
    /// The KMS provider refused or failed to wrap the new key
    #[error("KMS failure: {0}")]
    Kms(#[source] KmsError),

    /// The vault rejected the index or the key document
    #[error("key vault failure: {0}")]
    Vault(#[source] StoreError),

    /// The uniqueness constraint fired but the winning key could not be found
    #[error("alternate name {0:?} is taken but no key could be resolved for it")]
    UnresolvedConflict(String),
}

/// Errors specific to KMS provider operations.
#[derive(Debug)]
pub enum KmsError {
    /// A key was wrapped by a different provider than the one configured
    ProviderMismatch {
        /// Provider configured on this client
        expected: String,
        /// Provider recorded on the data key
        actual: String,
    },

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// The provider could not be reached
    Unavailable(String),
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderMismatch { expected, actual } => {
                write!(f, "key was wrapped by {actual}, client is configured for {expected}")
            }
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Unavailable(msg) => write!(f, "KMS unavailable: {msg}"),
        }
    }
}

impl std::error::Error for KmsError {}

/// Errors raised by document store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique index rejected the write
    #[error("duplicate key on unique index {field}: {value}")]
    DuplicateKey {
        /// Indexed field
        field: String,
        /// Offending value
        value: String,
    },

    /// The backend could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured bound
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored or submitted document is not well formed
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns `true` if this error is a uniqueness-constraint violation.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}
