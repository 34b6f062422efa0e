//! # `csfle`
//!
//! Key lifecycle and client construction for client-side field-level
//! encryption over a document store.
//!
//! ## Features
//!
//! - Data keys resolved by alternate name, provisioned on first run and
//!   safe against concurrent provisioning (the vault's unique index decides)
//! - Local master key file and pluggable KMS providers
//! - Encryption schemas binding field paths to a key and an algorithm
//! - Deterministic encryption (AES-SIV) for equality queries, randomized
//!   encryption (ChaCha20-Poly1305) for everything else
//! - Encrypted clients that fail closed when the crypto agent is gone
//!
//! ## Example
//!
//! ```rust,ignore
//! use csfle::prelude::*;
//!
//! let settings = Settings::from_env()?;
//! let factory = EncryptedClientFactory::new(Arc::new(MemoryConnector::new()));
//! let bootstrap = Bootstrap::new(settings, factory);
//!
//! let kms: Arc<dyn Kms> = Arc::new(bootstrap.local_kms()?);
//! let report = bootstrap.run(kms, &Customer::field_specs(), sample)?;
//! println!("data key {}", report.key.key_id);
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod binary;
pub mod bootstrap;
pub mod cipher;
pub mod client;
pub mod config;
pub mod error;
pub mod kdf;
pub mod key_vault;
pub mod kms;
pub mod master_key;
pub mod memory;
pub mod namespace;
pub mod schema;
pub mod store;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::agent::CryptoAgentLocator;
    pub use crate::bootstrap::{Bootstrap, BootstrapReport, KeyOrigin, KeyResolution};
    pub use crate::client::{
        EncryptedClient, EncryptedClientConfig, EncryptedClientFactory, PlainClient,
    };
    pub use crate::config::Settings;
    pub use crate::error::{Error, KmsError, StoreError};
    pub use crate::key_vault::{KeyId, KeyVaultManager};
    pub use crate::kms::{Kms, KmsProvider, LocalKms, MasterKeyDescriptor};
    pub use crate::master_key::{MasterKeyMaterial, MasterKeySource};
    pub use crate::memory::{MemoryConnector, MemoryStore};
    pub use crate::namespace::Namespace;
    pub use crate::schema::{build_schema, Algorithm, EncryptedFields, EncryptionSchema, FieldSpec};
    pub use crate::store::{ConnectionOptions, Connector, Document, DocumentStore, SchemeRouter};
}
