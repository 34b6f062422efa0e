//! Binary values in extended JSON form.
//!
//! Documents are plain JSON objects, so binary payloads (key ids, wrapped
//! keys, field ciphertexts) are carried the way extended JSON v2 carries
//! them: `{"$binary": {"base64": "...", "subType": "06"}}`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

/// Subtype for UUIDs.
pub const SUBTYPE_UUID: u8 = 0x04;

/// Subtype for field-level ciphertexts.
pub const SUBTYPE_ENCRYPTED: u8 = 0x06;

/// Subtype for arbitrary bytes.
pub const SUBTYPE_GENERIC: u8 = 0x00;

/// A typed binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    subtype: u8,
    bytes: Vec<u8>,
}

impl Binary {
    /// Creates a binary value.
    #[must_use]
    pub const fn new(subtype: u8, bytes: Vec<u8>) -> Self {
        Self { subtype, bytes }
    }

    /// Returns the subtype.
    #[must_use]
    pub const fn subtype(&self) -> u8 {
        self.subtype
    }

    /// Returns the payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the value and returns the payload.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Renders the value as an extended JSON `$binary` object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "$binary": {
                "base64": STANDARD.encode(&self.bytes),
                "subType": format!("{:02x}", self.subtype),
            }
        })
    }

    /// Parses an extended JSON `$binary` object.
    ///
    /// Returns `None` for anything else, including malformed base64.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let outer = value.as_object()?;
        if outer.len() != 1 {
            return None;
        }
        let inner = outer.get("$binary")?.as_object()?;
        let bytes = STANDARD.decode(inner.get("base64")?.as_str()?).ok()?;
        let subtype = u8::from_str_radix(inner.get("subType")?.as_str()?, 16).ok()?;
        Some(Self { subtype, bytes })
    }

    /// Returns `true` if `value` is a field-level ciphertext.
    #[must_use]
    pub fn is_encrypted(value: &Value) -> bool {
        Self::from_value(value).is_some_and(|b| b.subtype == SUBTYPE_ENCRYPTED)
    }
}
