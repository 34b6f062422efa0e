//! Field-level encryption with a single data key.
//!
//! Ciphertexts are self-describing blobs:
//!
//! ```text
//! [algorithm:1][key_id:16][bson_type:1][payload]
//! ```
//!
//! The 18-byte header is authenticated as associated data. For deterministic
//! fields the payload is AES-256-SIV output; for randomized fields it is
//! `nonce:12 || ChaCha20-Poly1305 output`.
//!
//! # Security Warning
//!
//! Deterministic encryption reveals equality patterns. Use it only for fields
//! that must support equality queries.

use crate::binary::{Binary, SUBTYPE_ENCRYPTED};
use crate::error::Error;
use crate::kdf::{derive_key, KeyPurpose, DEK_SIZE};
use crate::key_vault::KeyId;
use crate::schema::{Algorithm, BsonType};
use aes_siv::Aes256SivAead;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use serde_json::Value;
use zeroize::Zeroizing;

/// Size of the ciphertext header in bytes.
pub const HEADER_SIZE: usize = 18;

const NONCE_SIZE: usize = 12;

/// Parsed ciphertext header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CiphertextHeader {
    /// Algorithm the payload was produced with
    pub algorithm: Algorithm,
    /// Data key the payload was produced with
    pub key_id: KeyId,
    /// Type of the original value
    pub bson_type: BsonType,
}

impl CiphertextHeader {
    /// Serializes the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.algorithm.code();
        bytes[1..17].copy_from_slice(self.key_id.as_bytes());
        bytes[17] = self.bson_type.code();
        bytes
    }

    /// Parses the header at the start of `blob`, returning it and the payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the blob is too short or carries an
    /// unknown algorithm or type tag.
    pub fn parse(blob: &[u8]) -> Result<(Self, &[u8]), Error> {
        if blob.len() <= HEADER_SIZE {
            return Err(Error::Decryption(format!(
                "ciphertext too short: {} bytes",
                blob.len()
            )));
        }
        let algorithm = Algorithm::from_code(blob[0])
            .ok_or_else(|| Error::Decryption(format!("unknown algorithm tag {}", blob[0])))?;
        let key_bytes: [u8; 16] = blob[1..17]
            .try_into()
            .map_err(|_| Error::Decryption("invalid key id".to_string()))?;
        let bson_type = BsonType::from_code(blob[17])
            .ok_or_else(|| Error::Decryption(format!("unknown type tag {}", blob[17])))?;

        Ok((Self { algorithm, key_id: KeyId::from_bytes(key_bytes), bson_type }, &blob[HEADER_SIZE..]))
    }
}

/// Encrypts and decrypts field values with one data key.
pub struct FieldCipher {
    key_id: KeyId,
    siv_key: SecretVec<u8>,
    aead_key: SecretVec<u8>,
}

impl FieldCipher {
    /// Creates a cipher from an unwrapped DEK.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the DEK is not 96 bytes.
    pub fn new(key_id: KeyId, dek: &SecretVec<u8>) -> Result<Self, Error> {
        let dek = dek.expose_secret();
        if dek.len() != DEK_SIZE {
            return Err(Error::Decryption(format!(
                "data key {key_id} has {} bytes, expected {DEK_SIZE}",
                dek.len()
            )));
        }
        Ok(Self {
            key_id,
            siv_key: derive_key(dek, KeyPurpose::Deterministic)?,
            aead_key: derive_key(dek, KeyPurpose::Randomized)?,
        })
    }

    /// Returns the id of the data key this cipher uses.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Encrypts `value` into a subtype-6 binary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` for `null` values or if encryption fails.
    pub fn encrypt(&self, value: &Value, algorithm: Algorithm) -> Result<Binary, Error> {
        let bson_type = BsonType::of(value)
            .ok_or_else(|| Error::Encryption("null values are not encrypted".to_string()))?;
        let header = CiphertextHeader { algorithm, key_id: self.key_id, bson_type }.to_bytes();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut blob = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + plaintext.len() + 16);
        blob.extend_from_slice(&header);

        match algorithm {
            Algorithm::Deterministic => {
                let cipher = Aes256SivAead::new_from_slice(self.siv_key.expose_secret())
                    .map_err(|e| Error::Encryption(format!("invalid AES-SIV key: {e}")))?;
                // AES-SIV is deterministic - uses empty nonce
                let ciphertext = cipher
                    .encrypt(&Default::default(), Payload { msg: &plaintext, aad: &header })
                    .map_err(|e| Error::Encryption(format!("AES-SIV encryption failed: {e}")))?;
                blob.extend_from_slice(&ciphertext);
            }
            Algorithm::Random => {
                let cipher = ChaCha20Poly1305::new_from_slice(self.aead_key.expose_secret())
                    .map_err(|e| Error::Encryption(format!("invalid ChaCha20 key: {e}")))?;
                let mut nonce_bytes = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let ciphertext = cipher
                    .encrypt(&Nonce::from(nonce_bytes), Payload { msg: &plaintext, aad: &header })
                    .map_err(|e| {
                        Error::Encryption(format!("ChaCha20-Poly1305 encryption failed: {e}"))
                    })?;
                blob.extend_from_slice(&nonce_bytes);
                blob.extend_from_slice(&ciphertext);
            }
        }

        Ok(Binary::new(SUBTYPE_ENCRYPTED, blob))
    }

    /// Decrypts a subtype-6 binary produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` for malformed blobs or blobs made with
    /// another key, and `Error::AuthenticationFailed` if the payload does not
    /// authenticate.
    pub fn decrypt(&self, binary: &Binary) -> Result<Value, Error> {
        if binary.subtype() != SUBTYPE_ENCRYPTED {
            return Err(Error::Decryption(format!(
                "expected binary subtype 6, got {}",
                binary.subtype()
            )));
        }
        let blob = binary.bytes();
        let (header, payload) = CiphertextHeader::parse(blob)?;
        if header.key_id != self.key_id {
            return Err(Error::Decryption(format!(
                "ciphertext uses key {}, cipher holds {}",
                header.key_id, self.key_id
            )));
        }
        let aad = &blob[..HEADER_SIZE];

        let plaintext = Zeroizing::new(match header.algorithm {
            Algorithm::Deterministic => {
                let cipher = Aes256SivAead::new_from_slice(self.siv_key.expose_secret())
                    .map_err(|e| Error::Decryption(format!("invalid AES-SIV key: {e}")))?;
                cipher
                    .decrypt(&Default::default(), Payload { msg: payload, aad })
                    .map_err(|_| Error::AuthenticationFailed)?
            }
            Algorithm::Random => {
                if payload.len() <= NONCE_SIZE {
                    return Err(Error::Decryption("ciphertext payload truncated".to_string()));
                }
                let cipher = ChaCha20Poly1305::new_from_slice(self.aead_key.expose_secret())
                    .map_err(|e| Error::Decryption(format!("invalid ChaCha20 key: {e}")))?;
                let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
                let nonce_bytes: [u8; NONCE_SIZE] = nonce_bytes
                    .try_into()
                    .map_err(|_| Error::Decryption("invalid nonce size".to_string()))?;
                cipher
                    .decrypt(&Nonce::from(nonce_bytes), Payload { msg: ciphertext, aad })
                    .map_err(|_| Error::AuthenticationFailed)?
            }
        });

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Decryption(format!("decrypted value is not valid JSON: {e}")))
    }
}

/// Returns the id of the key a ciphertext was produced with.
///
/// # Errors
///
/// Returns `Error::Decryption` if the blob header is malformed.
pub fn ciphertext_key_id(binary: &Binary) -> Result<KeyId, Error> {
    CiphertextHeader::parse(binary.bytes()).map(|(header, _)| header.key_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::generate_dek;
    use proptest::prelude::*;
    use serde_json::json;

    fn cipher() -> FieldCipher {
        FieldCipher::new(KeyId::generate(), &generate_dek()).unwrap()
    }

    #[test]
    fn test_deterministic_round_trip() {
        let cipher = cipher();
        let value = json!("123-45-6789");

        let first = cipher.encrypt(&value, Algorithm::Deterministic).unwrap();
        let second = cipher.encrypt(&value, Algorithm::Deterministic).unwrap();

        assert_eq!(first, second);
        assert_eq!(cipher.decrypt(&first).unwrap(), value);
    }

    #[test]
    fn test_random_round_trip() {
        let cipher = cipher();
        let value = json!({"drug": "Lisinopril", "mg": 10});

        let first = cipher.encrypt(&value, Algorithm::Random).unwrap();
        let second = cipher.encrypt(&value, Algorithm::Random).unwrap();

        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).unwrap(), value);
        assert_eq!(cipher.decrypt(&second).unwrap(), value);
    }

    #[test]
    fn test_header_records_key_and_type() {
        let cipher = cipher();
        let blob = cipher.encrypt(&json!(42), Algorithm::Deterministic).unwrap();

        let (header, _) = CiphertextHeader::parse(blob.bytes()).unwrap();
        assert_eq!(header.algorithm, Algorithm::Deterministic);
        assert_eq!(header.bson_type, BsonType::Int);
        assert_eq!(ciphertext_key_id(&blob).unwrap(), cipher.key_id());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = cipher();
        for algorithm in [Algorithm::Deterministic, Algorithm::Random] {
            let blob = cipher.encrypt(&json!("secret"), algorithm).unwrap();
            let mut bytes = blob.into_bytes();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;

            let result = cipher.decrypt(&Binary::new(SUBTYPE_ENCRYPTED, bytes));
            assert!(matches!(result, Err(Error::AuthenticationFailed)));
        }
    }

    #[test]
    fn test_tampered_header_fails() {
        let cipher = cipher();
        let mut bytes = cipher.encrypt(&json!("secret"), Algorithm::Random).unwrap().into_bytes();
        bytes[17] = BsonType::Long.code();

        let result = cipher.decrypt(&Binary::new(SUBTYPE_ENCRYPTED, bytes));
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_other_key_is_rejected() {
        let blob = cipher().encrypt(&json!("secret"), Algorithm::Random).unwrap();
        assert!(matches!(cipher().decrypt(&blob), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_null_is_not_encrypted() {
        assert!(matches!(
            cipher().encrypt(&Value::Null, Algorithm::Random),
            Err(Error::Encryption(_))
        ));
    }

    #[test]
    fn test_short_dek_rejected() {
        let dek = SecretVec::new(vec![0u8; 32]);
        assert!(FieldCipher::new(KeyId::generate(), &dek).is_err());
    }

    proptest! {
        #[test]
        fn prop_ciphertext_hides_plaintext(text in "[a-zA-Z0-9-]{4,40}", random in any::<bool>()) {
            let cipher = cipher();
            let algorithm = if random { Algorithm::Random } else { Algorithm::Deterministic };
            let blob = cipher.encrypt(&json!(text), algorithm).unwrap();

            let bytes = blob.bytes();
            prop_assert!(!bytes.windows(text.len()).any(|w| w == text.as_bytes()));
            prop_assert_eq!(cipher.decrypt(&blob).unwrap(), json!(text));
        }
    }
}
