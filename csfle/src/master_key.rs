//! Master key (key-encrypting key) material loaded from files.

use crate::error::Error;
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

/// Length of a local master key in bytes.
pub const LOCAL_MASTER_KEY_SIZE: usize = 96;

/// Raw master key bytes.
///
/// The bytes are zeroized when the value is dropped and are never printed.
pub struct MasterKeyMaterial(SecretVec<u8>);

impl MasterKeyMaterial {
    /// Wraps raw bytes, checking them against the expected length.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if `bytes` is empty or not `expected_len` long.
    pub fn new(bytes: Vec<u8>, expected_len: usize) -> Result<Self, Error> {
        let material = SecretVec::new(bytes);
        let len = material.expose_secret().len();
        if len == 0 {
            return Err(Error::KeyMaterial("master key is empty".to_string()));
        }
        if len != expected_len {
            return Err(Error::KeyMaterial(format!(
                "master key must be {expected_len} bytes, got {len}"
            )));
        }
        Ok(Self(material))
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    /// Always `false`; empty material is rejected on construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for MasterKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKeyMaterial([REDACTED; {} bytes])", self.len())
    }
}

/// Reads (and generates) master key files of a fixed length.
///
/// # Example
///
/// ```rust,no_run
/// use csfle::master_key::MasterKeySource;
///
/// let material = MasterKeySource::local().read("master-key.txt")?;
/// # Ok::<(), csfle::error::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterKeySource {
    expected_len: usize,
}

impl MasterKeySource {
    /// Creates a source expecting keys of `expected_len` bytes.
    #[must_use]
    pub const fn new(expected_len: usize) -> Self {
        Self { expected_len }
    }

    /// Source for the local KMS provider (96-byte keys).
    #[must_use]
    pub const fn local() -> Self {
        Self::new(LOCAL_MASTER_KEY_SIZE)
    }

    /// Returns the expected key length.
    #[must_use]
    pub const fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Reads master key material from `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if the file is unreadable, empty or of the
    /// wrong length.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<MasterKeyMaterial, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::KeyMaterial(format!("cannot read master key {}: {e}", path.display()))
        })?;
        MasterKeyMaterial::new(bytes, self.expected_len).map_err(|e| match e {
            Error::KeyMaterial(msg) => Error::KeyMaterial(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Writes a fresh random master key to `path`.
    ///
    /// Refuses to overwrite an existing file. On Unix the file is created
    /// with `0600` permissions.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyMaterial` if the file exists or cannot be written.
    pub fn generate(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

        let path = path.as_ref();
        let mut key = Zeroizing::new(vec![0u8; self.expected_len]);
        OsRng.fill_bytes(&mut key);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| {
            Error::KeyMaterial(format!("cannot create master key {}: {e}", path.display()))
        })?;
        file.write_all(&key)
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::KeyMaterial(format!("cannot write master key: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_valid_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master-key.txt");
        std::fs::write(&path, vec![9u8; LOCAL_MASTER_KEY_SIZE]).unwrap();

        let material = MasterKeySource::local().read(&path).unwrap();
        assert_eq!(material.len(), LOCAL_MASTER_KEY_SIZE);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = MasterKeySource::local().read(dir.path().join("absent"));
        assert!(matches!(result, Err(Error::KeyMaterial(_))));
    }

    #[test]
    fn test_read_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let err = MasterKeySource::local().read(&path).unwrap_err();
        assert!(matches!(err, Error::KeyMaterial(ref msg) if msg.contains("empty")));
    }

    #[test]
    fn test_read_wrong_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, vec![1u8; 32]).unwrap();

        let err = MasterKeySource::local().read(&path).unwrap_err();
        assert!(matches!(err, Error::KeyMaterial(ref msg) if msg.contains("96")));
    }

    #[test]
    fn test_debug_does_not_leak() {
        let material = MasterKeyMaterial::new(vec![0xAB; 96], 96).unwrap();
        let printed = format!("{material:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn test_generate_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generated");
        let source = MasterKeySource::local();

        source.generate(&path).unwrap();
        assert_eq!(source.read(&path).unwrap().len(), LOCAL_MASTER_KEY_SIZE);

        // never overwrites
        assert!(matches!(source.generate(&path), Err(Error::KeyMaterial(_))));
    }
}
