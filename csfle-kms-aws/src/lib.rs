//! AWS KMS provider for `csfle`.
//!
//! Data keys are wrapped and unwrapped by an AWS KMS key, so the master key
//! never leaves KMS. Credentials are passed explicitly rather than taken
//! from the ambient credential chain.
//!
//! # Example
//!
//! ```rust,no_run
//! use csfle::config::Settings;
//! use csfle_kms_aws::AwsKms;
//!
//! # fn example() -> Result<(), csfle::error::Error> {
//! let settings = Settings::from_env()?;
//! let kms = AwsKms::from_provider(
//!     settings.kms_provider(),
//!     settings.connection().operation_timeout(),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! The provider drives the SDK on its own single-threaded runtime, so it
//! must not be called from inside another async runtime.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::config::Credentials;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use csfle::error::{Error, KmsError};
use csfle::kms::{AwsCredentials, AwsMasterKey, Kms, KmsProvider, KmsProviderKind, MasterKeyDescriptor};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

const PROVIDER_NAME: &str = "csfle";

/// KMS provider backed by an AWS KMS key.
pub struct AwsKms {
    client: KmsClient,
    master_key: AwsMasterKey,
    runtime: Runtime,
}

impl AwsKms {
    /// Creates a provider for `master_key` using static `credentials`.
    ///
    /// `timeout` bounds both connecting and each KMS call.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Unavailable` if the runtime cannot be started.
    pub fn new(
        credentials: &AwsCredentials,
        master_key: AwsMasterKey,
        timeout: Duration,
    ) -> Result<Self, KmsError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| KmsError::Unavailable(format!("cannot start runtime: {e}")))?;

        let credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.expose_secret().clone(),
            credentials.session_token.as_ref().map(|t| t.expose_secret().clone()),
            None,
            PROVIDER_NAME,
        );
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(timeout)
            .operation_timeout(timeout)
            .build();

        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(master_key.region.clone()))
                .credentials_provider(credentials)
                .timeout_config(timeouts)
                .load(),
        );
        debug!(region = %master_key.region, "configured AWS KMS client");

        Ok(Self { client: KmsClient::new(&config), master_key, runtime })
    }

    /// Creates a provider from a [`KmsProvider::Aws`] selection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `provider` is not the AWS variant and
    /// `Error::Kms` if the client cannot be built.
    pub fn from_provider(provider: &KmsProvider, timeout: Duration) -> Result<Self, Error> {
        match provider {
            KmsProvider::Aws { credentials, master_key } => {
                Ok(Self::new(credentials, master_key.clone(), timeout)?)
            }
            other => Err(Error::Config(format!(
                "AWS KMS cannot be built from a {} provider",
                other.kind()
            ))),
        }
    }

    /// Returns the key DEKs are wrapped under.
    #[must_use]
    pub const fn key(&self) -> &AwsMasterKey {
        &self.master_key
    }
}

impl fmt::Debug for AwsKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsKms").field("master_key", &self.master_key).finish_non_exhaustive()
    }
}

impl Kms for AwsKms {
    fn kind(&self) -> KmsProviderKind {
        KmsProviderKind::Aws
    }

    fn master_key(&self) -> MasterKeyDescriptor {
        MasterKeyDescriptor::Aws {
            region: self.master_key.region.clone(),
            key: self.master_key.key_arn.clone(),
        }
    }

    fn wrap_dek(&self, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        let response = self
            .runtime
            .block_on(
                self.client
                    .encrypt()
                    .key_id(&self.master_key.key_arn)
                    .plaintext(Blob::new(dek.expose_secret().clone()))
                    .send(),
            )
            .map_err(|e| KmsError::WrapFailed(format!("KMS encrypt failed: {e}")))?;

        let ciphertext = response
            .ciphertext_blob()
            .ok_or_else(|| KmsError::WrapFailed("KMS returned no ciphertext".to_string()))?;
        Ok(ciphertext.as_ref().to_vec())
    }

    fn unwrap_dek(
        &self,
        master_key: &MasterKeyDescriptor,
        wrapped: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        let key = match master_key {
            MasterKeyDescriptor::Aws { region, key } if *region == self.master_key.region => key,
            MasterKeyDescriptor::Aws { region, .. } => {
                return Err(KmsError::ProviderMismatch {
                    expected: format!("aws:{}", self.master_key.region),
                    actual: format!("aws:{region}"),
                })
            }
            other => {
                return Err(KmsError::ProviderMismatch {
                    expected: KmsProviderKind::Aws.to_string(),
                    actual: other.kind().to_string(),
                })
            }
        };

        let response = self
            .runtime
            .block_on(
                self.client.decrypt().key_id(key).ciphertext_blob(Blob::new(wrapped.to_vec())).send(),
            )
            .map_err(|e| KmsError::UnwrapFailed(format!("KMS decrypt failed: {e}")))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| KmsError::UnwrapFailed("KMS returned no plaintext".to_string()))?;
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}
