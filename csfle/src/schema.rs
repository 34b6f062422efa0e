//! Automatic encryption schemas.
//!
//! A schema binds sensitive field paths to a data key and an algorithm. It
//! is built from declarative [`FieldSpec`]s, so protecting another field
//! needs one more spec and nothing else.
//!
//! # Example
//!
//! ```
//! use csfle::key_vault::KeyId;
//! use csfle::schema::{build_schema, Algorithm, FieldSpec};
//!
//! let key_id = KeyId::generate();
//! let schema = build_schema(
//!     key_id,
//!     &[
//!         FieldSpec::new("ssn", "deterministic").with_bson_type("string"),
//!         FieldSpec::new("prescription", "random"),
//!     ],
//! )
//! .unwrap();
//!
//! assert_eq!(schema.rule("ssn").unwrap().algorithm, Algorithm::Deterministic);
//! ```

use crate::error::Error;
use crate::key_vault::KeyId;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// AES-256-SIV: equal plaintexts give equal ciphertexts, so the field
    /// can be queried by equality
    Deterministic,
    /// ChaCha20-Poly1305 with a random nonce: not queryable
    Random,
}

impl Algorithm {
    /// Canonical algorithm name written into the schema.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_SIV-Deterministic",
            Self::Random => "AEAD_CHACHA20_POLY1305-Random",
        }
    }

    /// Tag byte used in ciphertext headers.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    /// Inverse of [`Algorithm::code`].
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }

    /// Parses a field spec algorithm: a short name or the canonical name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("deterministic")
            || name.eq_ignore_ascii_case(Self::Deterministic.as_str())
        {
            Some(Self::Deterministic)
        } else if name.eq_ignore_ascii_case("random")
            || name.eq_ignore_ascii_case("randomized")
            || name.eq_ignore_ascii_case(Self::Random.as_str())
        {
            Some(Self::Random)
        } else {
            None
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BsonType {
    /// 64-bit float
    Double,
    /// UTF-8 string
    String,
    /// Embedded document
    Object,
    /// Array
    Array,
    /// Binary data
    BinData,
    /// Boolean
    Bool,
    /// Date
    Date,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 128-bit decimal
    Decimal,
}

impl BsonType {
    const ALL: [Self; 10] = [
        Self::Double,
        Self::String,
        Self::Object,
        Self::Array,
        Self::BinData,
        Self::Bool,
        Self::Date,
        Self::Int,
        Self::Long,
        Self::Decimal,
    ];

    /// Schema name of the type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::BinData => "binData",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Int => "int",
            Self::Long => "long",
            Self::Decimal => "decimal",
        }
    }

    /// Parses a schema type name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name.trim())
    }

    /// Type tag byte used in ciphertext headers.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::BinData => 0x05,
            Self::Bool => 0x08,
            Self::Date => 0x09,
            Self::Int => 0x10,
            Self::Long => 0x12,
            Self::Decimal => 0x13,
        }
    }

    /// Inverse of [`BsonType::code`].
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Whether deterministic encryption may be used for this type.
    #[must_use]
    pub const fn supports_deterministic(self) -> bool {
        !matches!(self, Self::Double | Self::Decimal | Self::Bool | Self::Object | Self::Array)
    }

    /// Infers the type of a JSON value (extended JSON for dates and binaries).
    ///
    /// Returns `None` for `null`.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::String(_) => Some(Self::String),
            Value::Array(_) => Some(Self::Array),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => Self::Int,
                Some(_) => Self::Long,
                // integers above i64::MAX only fit a double
                None => Self::Double,
            }),
            Value::Object(map) => Some(if map.len() == 1 && map.contains_key("$date") {
                Self::Date
            } else if map.len() == 1 && map.contains_key("$binary") {
                Self::BinData
            } else {
                Self::Object
            }),
        }
    }

    /// Whether a value of type `actual` may be stored in a field declared as `self`.
    #[must_use]
    pub fn accepts(self, actual: Self) -> bool {
        match self {
            Self::Long => matches!(actual, Self::Int | Self::Long),
            Self::Double | Self::Decimal => matches!(actual, Self::Int | Self::Long | Self::Double),
            declared => declared == actual,
        }
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declarative description of one sensitive field.
///
/// Values are kept as written and validated by [`build_schema`], so an
/// unknown algorithm or type is reported instead of dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    path: String,
    algorithm: String,
    bson_type: Option<String>,
}

impl FieldSpec {
    /// Creates a spec for `path` using `algorithm` (`deterministic` or `random`).
    #[must_use]
    pub fn new(path: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self { path: path.into(), algorithm: algorithm.into(), bson_type: None }
    }

    /// Declares the field's type.
    #[must_use]
    pub fn with_bson_type(mut self, bson_type: impl Into<String>) -> Self {
        self.bson_type = Some(bson_type.into());
        self
    }

    /// Parses `path:algorithm[:bsonType]`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemaBuild` if the spec does not have two or three parts.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = spec.trim().split(':').map(str::trim).collect();
        match parts.as_slice() {
            [path, algorithm] => Ok(Self::new(*path, *algorithm)),
            [path, algorithm, bson_type] => {
                Ok(Self::new(*path, *algorithm).with_bson_type(*bson_type))
            }
            _ => Err(Error::SchemaBuild(format!(
                "field spec must be path:algorithm[:bsonType], got {spec:?}"
            ))),
        }
    }

    /// Parses a comma-separated list of specs.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemaBuild` for the first malformed entry.
    pub fn parse_list(specs: &str) -> Result<Vec<Self>, Error> {
        specs.split(',').filter(|s| !s.trim().is_empty()).map(Self::parse).collect()
    }

    /// Returns the field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the algorithm as written.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the declared type as written, if any.
    #[must_use]
    pub fn bson_type(&self) -> Option<&str> {
        self.bson_type.as_deref()
    }
}

/// Types that declare their sensitive fields.
///
/// Usually derived with `#[derive(EncryptedFields)]` from `csfle-derive`.
pub trait EncryptedFields {
    /// Returns one spec per sensitive field.
    fn field_specs() -> Vec<FieldSpec>;
}

/// Encryption rule for one field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    /// Algorithm applied to the field
    pub algorithm: Algorithm,
    /// Declared type; values of other types are refused
    pub bson_type: Option<BsonType>,
    /// Data key the field is encrypted with
    pub key_id: KeyId,
}

impl FieldRule {
    fn to_json(self) -> Value {
        let mut encrypt = Map::new();
        if let Some(bson_type) = self.bson_type {
            encrypt.insert("bsonType".to_string(), json!(bson_type.name()));
        }
        encrypt.insert("algorithm".to_string(), json!(self.algorithm.as_str()));
        encrypt.insert("keyId".to_string(), json!([self.key_id.to_value()]));
        json!({ "encrypt": encrypt })
    }
}

/// Mapping from field path to encryption rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionSchema {
    fields: BTreeMap<String, FieldRule>,
}

impl EncryptionSchema {
    /// Returns the rule for `path`, if the path is protected.
    #[must_use]
    pub fn rule(&self, path: &str) -> Option<&FieldRule> {
        self.fields.get(path)
    }

    /// Iterates over `(path, rule)` pairs in path order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(path, rule)| (path.as_str(), rule))
    }

    /// Returns `true` if some protected path lies strictly below `path`.
    #[must_use]
    pub fn has_protected_descendant(&self, path: &str) -> bool {
        let prefix = format!("{path}.");
        self.fields.keys().any(|p| p.starts_with(&prefix))
    }

    /// Returns the protected path strictly above `path`, if any.
    #[must_use]
    pub fn protected_ancestor(&self, path: &str) -> Option<&str> {
        self.fields
            .keys()
            .find(|p| path.strip_prefix(p.as_str()).is_some_and(|rest| rest.starts_with('.')))
            .map(String::as_str)
    }

    /// Returns `true` if `path` is protected, or lies above or below a protected path.
    #[must_use]
    pub fn overlaps(&self, path: &str) -> bool {
        self.fields.contains_key(path)
            || self.has_protected_descendant(path)
            || self.protected_ancestor(path).is_some()
    }

    /// Every data key the schema references.
    #[must_use]
    pub fn key_ids(&self) -> BTreeSet<KeyId> {
        self.fields.values().map(|rule| rule.key_id).collect()
    }

    /// Number of protected paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no path is protected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the schema as a `$jsonSchema` document.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for (path, rule) in &self.fields {
            let segments: Vec<&str> = path.split('.').collect();
            insert_rule(&mut properties, &segments, *rule);
        }
        json!({ "bsonType": "object", "properties": properties })
    }
}

fn insert_rule(properties: &mut Map<String, Value>, segments: &[&str], rule: FieldRule) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        properties.insert((*head).to_string(), rule.to_json());
        return;
    }
    let entry = properties
        .entry((*head).to_string())
        .or_insert_with(|| json!({ "bsonType": "object", "properties": {} }));
    if let Some(nested) = entry.get_mut("properties").and_then(Value::as_object_mut) {
        insert_rule(nested, rest, rule);
    }
}

fn validate_path(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::SchemaBuild("field path is empty".to_string()));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(Error::SchemaBuild(format!("field path {path:?} has an empty segment")));
        }
        if segment.starts_with('$') {
            return Err(Error::SchemaBuild(format!(
                "field path {path:?} has an operator segment {segment:?}"
            )));
        }
    }
    if path == "_id" || path.starts_with("_id.") {
        return Err(Error::SchemaBuild("_id cannot be encrypted".to_string()));
    }
    Ok(())
}

fn build_rule(key_id: KeyId, spec: &FieldSpec) -> Result<FieldRule, Error> {
    let path = spec.path();
    let algorithm = Algorithm::parse(spec.algorithm()).ok_or_else(|| {
        Error::SchemaBuild(format!("field {path}: unknown algorithm {:?}", spec.algorithm()))
    })?;
    let bson_type = spec
        .bson_type()
        .map(|name| {
            BsonType::from_name(name).ok_or_else(|| {
                Error::SchemaBuild(format!("field {path}: unknown bsonType {name:?}"))
            })
        })
        .transpose()?;

    if algorithm == Algorithm::Deterministic {
        match bson_type {
            None => {
                return Err(Error::SchemaBuild(format!(
                    "field {path}: deterministic encryption requires a bsonType"
                )))
            }
            Some(t) if !t.supports_deterministic() => {
                return Err(Error::SchemaBuild(format!(
                    "field {path}: bsonType {t} cannot be encrypted deterministically"
                )))
            }
            Some(_) => {}
        }
    }

    Ok(FieldRule { algorithm, bson_type, key_id })
}

/// Builds a schema binding every spec to `key_id`.
///
/// Deterministic in its inputs: the same key id and specs always give an
/// equal schema, whatever the order of the field specs.
///
/// # Errors
///
/// Returns `Error::SchemaBuild` for malformed or unknown specs, duplicate
/// paths, and paths nested inside other protected paths.
pub fn build_schema(key_id: KeyId, specs: &[FieldSpec]) -> Result<EncryptionSchema, Error> {
    let mut fields = BTreeMap::new();
    for spec in specs {
        validate_path(spec.path())?;
        let rule = build_rule(key_id, spec)?;
        if fields.insert(spec.path().to_string(), rule).is_some() {
            return Err(Error::SchemaBuild(format!("field {} is declared twice", spec.path())));
        }
    }

    let schema = EncryptionSchema { fields };
    for path in schema.fields.keys() {
        if let Some(parent) = schema.protected_ancestor(path) {
            return Err(Error::SchemaBuild(format!(
                "field {path} is nested inside protected field {parent}"
            )));
        }
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn customer_specs() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("ssn", "deterministic").with_bson_type("string"),
            FieldSpec::new("prescription", "random").with_bson_type("string"),
            FieldSpec::new("insurance.policyNumber", "deterministic").with_bson_type("int"),
        ]
    }

    #[test]
    fn test_build_schema_binds_key_and_algorithm() {
        let key_id = KeyId::generate();
        let schema = build_schema(key_id, &customer_specs()).unwrap();

        assert_eq!(schema.len(), 3);
        let ssn = schema.rule("ssn").unwrap();
        assert_eq!(ssn.algorithm, Algorithm::Deterministic);
        assert_eq!(ssn.bson_type, Some(BsonType::String));
        assert_eq!(ssn.key_id, key_id);
        assert_eq!(schema.rule("prescription").unwrap().algorithm, Algorithm::Random);
        assert_eq!(schema.key_ids().into_iter().collect::<Vec<_>>(), vec![key_id]);
    }

    #[test]
    fn test_json_schema_rendering() {
        let key_id = KeyId::generate();
        let schema = build_schema(key_id, &customer_specs()).unwrap();
        let rendered = schema.to_json_schema();

        assert_eq!(rendered["bsonType"], "object");
        assert_eq!(
            rendered["properties"]["ssn"]["encrypt"]["algorithm"],
            "AEAD_AES_256_SIV-Deterministic"
        );
        assert_eq!(rendered["properties"]["ssn"]["encrypt"]["keyId"][0], key_id.to_value());
        assert_eq!(
            rendered["properties"]["insurance"]["properties"]["policyNumber"]["encrypt"]
                ["bsonType"],
            "int"
        );
    }

    #[test]
    fn test_random_without_type_is_allowed() {
        let schema = build_schema(KeyId::generate(), &[FieldSpec::new("notes", "randomized")]);
        assert_eq!(schema.unwrap().rule("notes").unwrap().bson_type, None);
    }

    #[test]
    fn test_malformed_specs_fail() {
        let key_id = KeyId::generate();
        let bad = [
            FieldSpec::new("", "random"),
            FieldSpec::new("a..b", "random"),
            FieldSpec::new("$where", "random"),
            FieldSpec::new("_id", "random"),
            FieldSpec::new("ssn", "rot13"),
            FieldSpec::new("ssn", "random").with_bson_type("varchar"),
            FieldSpec::new("ssn", "deterministic"),
            FieldSpec::new("score", "deterministic").with_bson_type("double"),
        ];
        for spec in bad {
            let result = build_schema(key_id, &[spec.clone()]);
            assert!(matches!(result, Err(Error::SchemaBuild(_))), "accepted {spec:?}");
        }
    }

    #[test]
    fn test_duplicate_and_nested_paths_fail() {
        let key_id = KeyId::generate();
        let duplicate = [FieldSpec::new("ssn", "random"), FieldSpec::new("ssn", "random")];
        assert!(matches!(build_schema(key_id, &duplicate), Err(Error::SchemaBuild(_))));

        let nested = [FieldSpec::new("address", "random"), FieldSpec::new("address.zip", "random")];
        assert!(matches!(build_schema(key_id, &nested), Err(Error::SchemaBuild(_))));

        // "address-line" sorts between "address" and "address.zip"
        let interleaved = [
            FieldSpec::new("address", "random"),
            FieldSpec::new("address-line", "random"),
            FieldSpec::new("address.zip", "random"),
        ];
        assert!(matches!(build_schema(key_id, &interleaved), Err(Error::SchemaBuild(_))));

        // a sibling sharing a name prefix is not nested
        let siblings = [FieldSpec::new("ssn", "random"), FieldSpec::new("ssn_last4", "random")];
        assert!(build_schema(key_id, &siblings).is_ok());
    }

    #[test]
    fn test_field_spec_parse() {
        let spec = FieldSpec::parse("ssn:deterministic:string").unwrap();
        assert_eq!(spec, FieldSpec::new("ssn", "deterministic").with_bson_type("string"));

        let list = FieldSpec::parse_list("ssn:deterministic:string, prescription:random").unwrap();
        assert_eq!(list.len(), 2);

        assert!(matches!(FieldSpec::parse("ssn"), Err(Error::SchemaBuild(_))));
        assert!(matches!(FieldSpec::parse("a:b:c:d"), Err(Error::SchemaBuild(_))));
    }

    #[test]
    fn test_bson_type_inference() {
        assert_eq!(BsonType::of(&json!("x")), Some(BsonType::String));
        assert_eq!(BsonType::of(&json!(7)), Some(BsonType::Int));
        assert_eq!(BsonType::of(&json!(5_000_000_000_i64)), Some(BsonType::Long));
        assert_eq!(BsonType::of(&json!(1.5)), Some(BsonType::Double));
        assert_eq!(BsonType::of(&json!({"$date": "2024-01-01T00:00:00Z"})), Some(BsonType::Date));
        assert_eq!(BsonType::of(&Value::Null), None);
        assert!(BsonType::Long.accepts(BsonType::Int));
        assert!(!BsonType::Int.accepts(BsonType::Long));
    }

    #[test]
    fn test_path_relationships() {
        let schema = build_schema(
            KeyId::from_bytes([1; 16]),
            &[FieldSpec::new("insurance.policyNumber", "deterministic").with_bson_type("int")],
        )
        .unwrap();

        assert!(schema.has_protected_descendant("insurance"));
        assert_eq!(schema.protected_ancestor("insurance.policyNumber.digits"), Some("insurance.policyNumber"));
        assert_eq!(schema.protected_ancestor("insurance.policyNumberSuffix"), None);
        assert!(schema.overlaps("insurance.policyNumber"));
        assert!(schema.overlaps("insurance"));
        assert!(!schema.overlaps("insurance.provider"));
    }

    #[test]
    fn test_oversized_unsigned_is_not_long() {
        assert_eq!(BsonType::of(&json!(i64::MAX)), Some(BsonType::Long));
        assert_eq!(BsonType::of(&json!(u64::MAX)), Some(BsonType::Double));
        assert!(!BsonType::Long.accepts(BsonType::of(&json!(u64::MAX)).unwrap()));
    }

    proptest! {
        #[test]
        fn prop_schema_ignores_spec_order(reverse in any::<bool>(), byte in any::<u8>()) {
            let key_id = KeyId::from_bytes([byte; 16]);
            let mut specs = customer_specs();
            let expected = build_schema(key_id, &specs).unwrap();
            if reverse {
                specs.reverse();
            }
            prop_assert_eq!(build_schema(key_id, &specs).unwrap(), expected);
        }
    }
}
