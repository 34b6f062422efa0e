//! KMS provider abstraction and the local master key provider.
//!
//! Provider selection is a tagged union ([`KmsProvider`]) carrying the
//! provider-specific credential shape. The runtime side is the [`Kms`] trait,
//! which wraps freshly generated DEKs under the master key and unwraps them
//! again when a client needs to decrypt.

use crate::error::{Error, KmsError};
use crate::kdf::{derive_key, KeyPurpose};
use crate::master_key::{MasterKeyMaterial, MasterKeySource, LOCAL_MASTER_KEY_SIZE};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretString, SecretVec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const NONCE_SIZE: usize = 12;
const LOCAL_WRAP_AAD: &[u8] = b"csfle-local-kms";

/// Provider tag, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KmsProviderKind {
    /// Master key read from a local file
    Local,
    /// AWS Key Management Service
    Aws,
}

impl KmsProviderKind {
    /// Returns the configuration name of the provider.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws => "aws",
        }
    }
}

impl fmt::Display for KmsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmsProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "aws" => Ok(Self::Aws),
            other => Err(Error::Config(format!(
                "unknown KMS provider {other:?} (supported: local, aws)"
            ))),
        }
    }
}

/// Static AWS credentials.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Optional session token for temporary credentials
    pub session_token: Option<SecretString>,
}

/// The AWS KMS key DEKs are wrapped under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsMasterKey {
    /// Region hosting the key
    pub region: String,
    /// Key ARN (or alias ARN)
    pub key_arn: String,
}

/// KMS provider selection with provider-specific credentials.
#[derive(Debug, Clone)]
pub enum KmsProvider {
    /// Local master key file
    Local {
        /// Path of the 96-byte master key file
        master_key_file: PathBuf,
    },
    /// AWS KMS
    Aws {
        /// Credentials used to call KMS
        credentials: AwsCredentials,
        /// Key used to wrap DEKs
        master_key: AwsMasterKey,
    },
}

impl KmsProvider {
    /// Returns the provider tag.
    #[must_use]
    pub const fn kind(&self) -> KmsProviderKind {
        match self {
            Self::Local { .. } => KmsProviderKind::Local,
            Self::Aws { .. } => KmsProviderKind::Aws,
        }
    }
}

/// Description of the master key a data key was wrapped under.
///
/// Stored on every data key document as `masterKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum MasterKeyDescriptor {
    /// Wrapped with the local master key
    Local,
    /// Wrapped with an AWS KMS key
    Aws {
        /// Region hosting the key
        region: String,
        /// Key ARN
        key: String,
    },
}

impl MasterKeyDescriptor {
    /// Returns the provider tag.
    #[must_use]
    pub const fn kind(&self) -> KmsProviderKind {
        match self {
            Self::Local => KmsProviderKind::Local,
            Self::Aws { .. } => KmsProviderKind::Aws,
        }
    }
}

/// Wraps and unwraps data encryption keys under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`); one provider is
/// shared by the key vault manager and every client built from it.
pub trait Kms: Send + Sync {
    /// Returns the provider tag.
    fn kind(&self) -> KmsProviderKind;

    /// Describes the master key new DEKs are wrapped under.
    fn master_key(&self) -> MasterKeyDescriptor;

    /// Wraps (encrypts) a freshly generated DEK.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::WrapFailed` or `KmsError::Unavailable` on failure.
    fn wrap_dek(&self, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError>;

    /// Unwraps (decrypts) a stored DEK.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::ProviderMismatch` if the key was wrapped by another
    /// provider, `KmsError::UnwrapFailed` if the wrapped bytes do not
    /// authenticate.
    fn unwrap_dek(
        &self,
        master_key: &MasterKeyDescriptor,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError>;
}

/// KMS provider backed by a local 96-byte master key.
///
/// The master key itself is not retained: a wrapping key is derived from it
/// on construction and the material is dropped (and zeroized) immediately.
pub struct LocalKms {
    wrapping_key: SecretVec<u8>,
}

impl LocalKms {
    /// Creates a provider from master key material, consuming it.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if the material is not 96 bytes.
    pub fn new(master_key: MasterKeyMaterial) -> Result<Self, Error> {
        if master_key.len() != LOCAL_MASTER_KEY_SIZE {
            return Err(Error::KeyMaterial(format!(
                "local KMS requires a {LOCAL_MASTER_KEY_SIZE}-byte master key, got {}",
                master_key.len()
            )));
        }
        let wrapping_key = derive_key(master_key.expose(), KeyPurpose::LocalWrap)?;
        drop(master_key);
        Ok(Self { wrapping_key })
    }

    /// Reads the master key from `path` and creates a provider from it.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if the file is unreadable, empty or of
    /// the wrong length.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::new(MasterKeySource::local().read(path)?)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, String> {
        ChaCha20Poly1305::new_from_slice(self.wrapping_key.expose_secret())
            .map_err(|e| format!("invalid wrapping key: {e}"))
    }
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms").finish_non_exhaustive()
    }
}

impl Kms for LocalKms {
    fn kind(&self) -> KmsProviderKind {
        KmsProviderKind::Local
    }

    fn master_key(&self) -> MasterKeyDescriptor {
        MasterKeyDescriptor::Local
    }

    fn wrap_dek(&self, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        let cipher = self.cipher().map_err(KmsError::WrapFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                &Nonce::from(nonce_bytes),
                Payload { msg: dek.expose_secret(), aad: LOCAL_WRAP_AAD },
            )
            .map_err(|e| KmsError::WrapFailed(format!("ChaCha20-Poly1305 wrap failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_dek(
        &self,
        master_key: &MasterKeyDescriptor,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        if master_key.kind() != KmsProviderKind::Local {
            return Err(KmsError::ProviderMismatch {
                expected: KmsProviderKind::Local.to_string(),
                actual: master_key.kind().to_string(),
            });
        }
        if wrapped.len() <= NONCE_SIZE {
            return Err(KmsError::UnwrapFailed("wrapped key is truncated".to_string()));
        }

        let cipher = self.cipher().map_err(KmsError::UnwrapFailed)?;
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
        let nonce_bytes: [u8; NONCE_SIZE] = nonce_bytes
            .try_into()
            .map_err(|_| KmsError::UnwrapFailed("invalid nonce size".to_string()))?;

        cipher
            .decrypt(&Nonce::from(nonce_bytes), Payload { msg: ciphertext, aad: LOCAL_WRAP_AAD })
            .map(SecretVec::new)
            .map_err(|_| {
                KmsError::UnwrapFailed("authentication failed (wrong master key?)".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::generate_dek;

    fn local_kms(byte: u8) -> LocalKms {
        LocalKms::new(MasterKeyMaterial::new(vec![byte; LOCAL_MASTER_KEY_SIZE], 96).unwrap())
            .unwrap()
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("local".parse::<KmsProviderKind>().unwrap(), KmsProviderKind::Local);
        assert_eq!(" AWS ".parse::<KmsProviderKind>().unwrap(), KmsProviderKind::Aws);
        assert!(matches!("gcp".parse::<KmsProviderKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let kms = local_kms(7);
        let dek = generate_dek();

        let wrapped = kms.wrap_dek(&dek).unwrap();
        assert_ne!(&wrapped[NONCE_SIZE..], dek.expose_secret().as_slice());

        let unwrapped = kms.unwrap_dek(&MasterKeyDescriptor::Local, &wrapped).unwrap();
        assert_eq!(unwrapped.expose_secret(), dek.expose_secret());
    }

    #[test]
    fn test_unwrap_with_other_master_key_fails() {
        let dek = generate_dek();
        let wrapped = local_kms(1).wrap_dek(&dek).unwrap();

        let result = local_kms(2).unwrap_dek(&MasterKeyDescriptor::Local, &wrapped);
        assert!(matches!(result, Err(KmsError::UnwrapFailed(_))));
    }

    #[test]
    fn test_unwrap_rejects_foreign_provider() {
        let kms = local_kms(1);
        let wrapped = kms.wrap_dek(&generate_dek()).unwrap();
        let aws = MasterKeyDescriptor::Aws {
            region: "us-east-1".to_string(),
            key: "arn:aws:kms:us-east-1:123456789012:key/test".to_string(),
        };

        assert!(matches!(kms.unwrap_dek(&aws, &wrapped), Err(KmsError::ProviderMismatch { .. })));
    }

    #[test]
    fn test_local_kms_requires_96_bytes() {
        let material = MasterKeyMaterial::new(vec![1u8; 32], 32).unwrap();
        assert!(matches!(LocalKms::new(material), Err(Error::KeyMaterial(_))));
    }

    #[test]
    fn test_descriptor_serialization() {
        let local = serde_json::to_value(MasterKeyDescriptor::Local).unwrap();
        assert_eq!(local, serde_json::json!({"provider": "local"}));

        let aws: MasterKeyDescriptor = serde_json::from_value(serde_json::json!({
            "provider": "aws",
            "region": "eu-west-1",
            "key": "arn:aws:kms:eu-west-1:1:key/k"
        }))
        .unwrap();
        assert_eq!(aws.kind(), KmsProviderKind::Aws);
    }
}
