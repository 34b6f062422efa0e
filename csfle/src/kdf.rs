//! Key generation and derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! A data encryption key (DEK) is 96 random bytes. The keys actually used by
//! the field ciphers, and the local KMS wrapping key, are derived from their
//! input key material with HKDF-SHA256 so that each purpose gets an
//! independent key.

use crate::error::Error;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// DEK size in bytes (768 bits).
pub const DEK_SIZE: usize = 96;

/// Purpose a derived key is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// AES-256-SIV key for deterministic field encryption (64 bytes)
    Deterministic,
    /// ChaCha20-Poly1305 key for randomized field encryption (32 bytes)
    Randomized,
    /// ChaCha20-Poly1305 key the local KMS wraps DEKs with (32 bytes)
    LocalWrap,
}

impl KeyPurpose {
    /// HKDF `info` label for this purpose.
    const fn info(self) -> &'static [u8] {
        match self {
            Self::Deterministic => b"csfle|field|deterministic|v1",
            Self::Randomized => b"csfle|field|random|v1",
            Self::LocalWrap => b"csfle|kms|local|v1",
        }
    }

    /// Length of the derived key in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Deterministic => 64,
            Self::Randomized | Self::LocalWrap => 32,
        }
    }
}

/// Derives a purpose-specific key from input key material.
///
/// # Errors
///
/// Returns `Error::Encryption` if the derivation fails.
///
/// # Example
///
/// ```
/// use csfle::kdf::{derive_key, KeyPurpose};
/// use secrecy::ExposeSecret;
///
/// let key = derive_key(&[7u8; 96], KeyPurpose::Deterministic).unwrap();
/// assert_eq!(key.expose_secret().len(), 64);
/// ```
pub fn derive_key(ikm: &[u8], purpose: KeyPurpose) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);

    let mut okm = vec![0u8; purpose.key_len()];
    hkdf.expand(purpose.info(), &mut okm)
        .map_err(|_| Error::Encryption(format!("key derivation failed for {purpose:?}")))?;

    Ok(SecretVec::new(okm))
}

/// Generates a random DEK.
///
/// This DEK must be wrapped by a KMS provider before it is stored.
///
/// # Example
///
/// ```
/// use csfle::kdf::{generate_dek, DEK_SIZE};
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// assert_eq!(dek.expose_secret().len(), DEK_SIZE);
/// ```
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let ikm = [1u8; DEK_SIZE];

        let key1 = derive_key(&ikm, KeyPurpose::Randomized).expect("derivation failed");
        let key2 = derive_key(&ikm, KeyPurpose::Randomized).expect("derivation failed");

        assert_eq!(key1.expose_secret(), key2.expose_secret());
    }

    #[test]
    fn test_derive_key_purposes_are_independent() {
        let ikm = [1u8; DEK_SIZE];

        let random = derive_key(&ikm, KeyPurpose::Randomized).unwrap();
        let wrap = derive_key(&ikm, KeyPurpose::LocalWrap).unwrap();
        let siv = derive_key(&ikm, KeyPurpose::Deterministic).unwrap();

        assert_ne!(random.expose_secret(), wrap.expose_secret());
        assert_ne!(&random.expose_secret()[..], &siv.expose_secret()[..32]);
    }

    #[test]
    fn test_derive_key_output_length() {
        let ikm = [42u8; DEK_SIZE];
        for purpose in [KeyPurpose::Deterministic, KeyPurpose::Randomized, KeyPurpose::LocalWrap] {
            let key = derive_key(&ikm, purpose).unwrap();
            assert_eq!(key.expose_secret().len(), purpose.key_len());
        }
    }

    #[test]
    fn test_derive_key_with_different_material() {
        let key1 = derive_key(&[1u8; DEK_SIZE], KeyPurpose::Deterministic).unwrap();
        let key2 = derive_key(&[2u8; DEK_SIZE], KeyPurpose::Deterministic).unwrap();

        assert_ne!(key1.expose_secret(), key2.expose_secret());
    }

    #[test]
    fn test_generate_dek() {
        let dek1 = generate_dek();
        let dek2 = generate_dek();

        assert_ne!(dek1.expose_secret(), dek2.expose_secret());
        assert_eq!(dek1.expose_secret().len(), DEK_SIZE);
        assert_eq!(dek2.expose_secret().len(), DEK_SIZE);
    }

    // RFC 5869 Test Case 1 (HKDF-SHA256)
    #[test]
    fn test_hkdf_rfc5869_test_case_1() {
        const IKM_HEX: &str = "0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b";
        const SALT_HEX: &str = "000102030405060708090a0b0c";
        const INFO_HEX: &str = "f0f1f2f3f4f5f6f7f8f9";
        const EXPECTED_OKM_HEX: &str =
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865";

        let ikm = hex::decode(IKM_HEX).unwrap();
        let salt = hex::decode(SALT_HEX).unwrap();
        let info = hex::decode(INFO_HEX).unwrap();
        let expected_okm = hex::decode(EXPECTED_OKM_HEX).unwrap();

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut okm = vec![0u8; 42];
        hkdf.expand(&info, &mut okm).expect("HKDF expand failed");

        assert_eq!(okm, expected_okm);
    }
}
