//! Database/collection pairs identifying where documents live.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// A `{database, collection}` pair.
///
/// Used both for the key vault (where data keys are stored) and for the
/// collection an encrypted client writes to.
///
/// # Example
///
/// ```
/// use csfle::namespace::Namespace;
///
/// let ns: Namespace = "encryption.__keyVault".parse().unwrap();
/// assert_eq!(ns.database(), "encryption");
/// assert_eq!(ns.collection(), "__keyVault");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace, rejecting empty names and dots in the database name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if either part is empty or the database name
    /// contains a `.`.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, Error> {
        let database = database.into();
        let collection = collection.into();
        if database.is_empty() || collection.is_empty() {
            return Err(Error::Config(format!(
                "namespace parts must be non-empty (got {database:?}.{collection:?})"
            )));
        }
        if database.contains('.') {
            return Err(Error::Config(format!("database name must not contain '.': {database}")));
        }
        Ok(Self { database, collection })
    }

    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (database, collection) = s
            .split_once('.')
            .ok_or_else(|| Error::Config(format!("namespace must be <db>.<collection>: {s}")))?;
        Self::new(database, collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_display() {
        let ns = Namespace::new("medicalRecords", "patients").unwrap();
        assert_eq!(ns.to_string(), "medicalRecords.patients");
    }

    #[test]
    fn test_namespace_parse_keeps_dots_in_collection() {
        let ns: Namespace = "app.system.keys".parse().unwrap();
        assert_eq!(ns.database(), "app");
        assert_eq!(ns.collection(), "system.keys");
    }

    #[test]
    fn test_namespace_rejects_empty_parts() {
        assert!(matches!(Namespace::new("", "keys"), Err(Error::Config(_))));
        assert!(matches!(Namespace::new("db", ""), Err(Error::Config(_))));
        assert!(matches!("nodot".parse::<Namespace>(), Err(Error::Config(_))));
    }
}
