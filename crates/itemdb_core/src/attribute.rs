//! Attribute descriptors and the in/out filters.
//!
//! An attribute knows three things: how to validate and encode an in-memory
//! [`Value`] into a storage value (the in-filter), how to decode a storage
//! value back (the out-filter), and how it renders as a SQL column. The
//! kind is a closed sum; item "classes" are descriptors built from these at
//! registration time.

use crate::error::{EngineError, EngineResult};
use crate::types::StoreId;
use crate::value::{Decimal, Value};
use chrono::DateTime;
use itemdb_sql::SqlValue;
use std::fmt;
use std::sync::Arc;

/// Separator used to encode text lists into a single TEXT column.
const TEXT_LIST_SEPARATOR: char = '\u{0002}';

/// What happens to referring items when a referent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Referring items are deleted along with the referent.
    Cascade,
    /// Deletion fails while a referrer exists.
    Disallow,
    /// Referrers survive; their reference reads as null afterward.
    Nullify,
}

impl DeletionPolicy {
    fn canonical(self) -> &'static str {
        match self {
            Self::Cascade => "cascade",
            Self::Disallow => "disallow",
            Self::Nullify => "nullify",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "cascade" => Some(Self::Cascade),
            "disallow" => Some(Self::Disallow),
            "nullify" => Some(Self::Nullify),
            _ => None,
        }
    }
}

/// Storage kind of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Signed 64-bit integer.
    Integer,
    /// IEEE-754 double.
    Float,
    /// Fixed-point decimal at a declared precision.
    Decimal {
        /// Number of decimal places.
        places: u32,
    },
    /// Boolean, stored as 0/1.
    Boolean,
    /// Text, case-sensitive or not (collation applies to comparisons).
    Text {
        /// Whether comparisons are case-sensitive.
        case_sensitive: bool,
    },
    /// Byte blob.
    Bytes,
    /// Timestamp stored as microseconds since the Unix epoch.
    Timestamp,
    /// Store-relative filesystem path stored as text with `/` separators.
    Path,
    /// Ordered text list encoded into one delimited TEXT column.
    TextList,
    /// Reference to another item in the same store.
    Reference {
        /// Policy applied when the referent is deleted.
        policy: DeletionPolicy,
    },
}

impl AttributeKind {
    /// Case-sensitive text.
    #[must_use]
    pub const fn text() -> Self {
        Self::Text {
            case_sensitive: true,
        }
    }

    /// Case-insensitive text.
    #[must_use]
    pub const fn text_case_insensitive() -> Self {
        Self::Text {
            case_sensitive: false,
        }
    }

    /// Fixed-point decimal with the given number of places.
    #[must_use]
    pub const fn decimal(places: u32) -> Self {
        Self::Decimal { places }
    }

    /// Reference with the given deletion policy.
    #[must_use]
    pub const fn reference(policy: DeletionPolicy) -> Self {
        Self::Reference { policy }
    }

    /// Returns the SQLite column type for this kind.
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Integer
            | Self::Decimal { .. }
            | Self::Boolean
            | Self::Timestamp
            | Self::Reference { .. } => "INTEGER",
            Self::Float => "REAL",
            Self::Text { .. } | Self::Path | Self::TextList => "TEXT",
            Self::Bytes => "BLOB",
        }
    }

    /// Renders the canonical kind string stored in the `attributes` table.
    ///
    /// The string round-trips through [`AttributeKind::parse`], including
    /// decimal precision and deletion policy, which is what lets old type
    /// shapes be rebuilt from metadata alone.
    #[must_use]
    pub fn canonical_name(&self) -> String {
        match self {
            Self::Integer => "integer".to_string(),
            Self::Float => "float".to_string(),
            Self::Decimal { places } => format!("decimal({places})"),
            Self::Boolean => "boolean".to_string(),
            Self::Text {
                case_sensitive: true,
            } => "text".to_string(),
            Self::Text {
                case_sensitive: false,
            } => "text-ci".to_string(),
            Self::Bytes => "bytes".to_string(),
            Self::Timestamp => "timestamp".to_string(),
            Self::Path => "path".to_string(),
            Self::TextList => "textlist".to_string(),
            Self::Reference { policy } => format!("reference({})", policy.canonical()),
        }
    }

    /// Parses a canonical kind string.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "integer" => return Some(Self::Integer),
            "float" => return Some(Self::Float),
            "boolean" => return Some(Self::Boolean),
            "text" => return Some(Self::text()),
            "text-ci" => return Some(Self::text_case_insensitive()),
            "bytes" => return Some(Self::Bytes),
            "timestamp" => return Some(Self::Timestamp),
            "path" => return Some(Self::Path),
            "textlist" => return Some(Self::TextList),
            _ => {}
        }
        if let Some(places) = text
            .strip_prefix("decimal(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return places.parse().ok().map(|places| Self::Decimal { places });
        }
        if let Some(policy) = text
            .strip_prefix("reference(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return DeletionPolicy::parse(policy).map(|policy| Self::Reference { policy });
        }
        None
    }
}

/// A declared default for an attribute.
#[derive(Clone)]
pub enum DefaultValue {
    /// A fixed value.
    Value(Value),
    /// A value produced at item-creation time.
    Compute(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    /// Produces the default value.
    #[must_use]
    pub fn produce(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Compute(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Compute(_) => f.write_str("Compute(..)"),
        }
    }
}

/// Describes one column on an item type.
#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    name: String,
    kind: AttributeKind,
    indexed: bool,
    allow_none: bool,
    default: Option<DefaultValue>,
    doc: Option<String>,
}

impl AttributeDescriptor {
    /// Creates a descriptor with the given name and kind.
    ///
    /// Attributes start out non-indexed, non-nullable, and without a
    /// default.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            indexed: false,
            allow_none: false,
            default: None,
            doc: None,
        }
    }

    /// Marks the attribute as indexed.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Permits null for this attribute.
    #[must_use]
    pub fn allow_none(mut self) -> Self {
        self.allow_none = true;
        self
    }

    /// Sets a fixed default value.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    /// Sets a default produced at creation time.
    #[must_use]
    pub fn default_with(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Compute(Arc::new(f)));
        self
    }

    /// Attaches a docstring, persisted in the `attributes` table.
    #[must_use]
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Returns the attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the attribute kind.
    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Whether the attribute carries a single-column index.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Whether null is permitted.
    #[must_use]
    pub fn allows_none(&self) -> bool {
        self.allow_none
    }

    /// Returns the declared default, if any.
    #[must_use]
    pub fn default(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    /// Returns the docstring, if any.
    #[must_use]
    pub fn docstring(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Produces the value an unset attribute starts with.
    ///
    /// Without a declared default, nullable attributes start null and
    /// non-nullable attributes have no starting value (creation must supply
    /// one).
    #[must_use]
    pub fn initial_value(&self) -> Option<Value> {
        match (&self.default, self.allow_none) {
            (Some(d), _) => Some(d.produce()),
            (None, true) => Some(Value::Null),
            (None, false) => None,
        }
    }

    /// Validates and encodes an in-memory value to its storage form.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Constraint`] for a null against a
    /// non-nullable attribute, a value of the wrong variant, out-of-range
    /// numbers, NUL bytes in text, malformed paths, or list entries that
    /// collide with the encoding separator.
    pub fn encode(&self, value: &Value) -> EngineResult<SqlValue> {
        if value.is_null() {
            return if self.allow_none {
                Ok(SqlValue::Null)
            } else {
                Err(EngineError::constraint(&self.name, "null is not allowed"))
            };
        }
        let reject = |expected: &str| {
            Err(EngineError::constraint(
                &self.name,
                format!("expected {expected}, got {}", value.kind_name()),
            ))
        };
        match self.kind {
            AttributeKind::Integer => match value {
                Value::Integer(i) => Ok(SqlValue::Integer(*i)),
                _ => reject("integer"),
            },
            AttributeKind::Float => match value {
                Value::Float(f) => Ok(SqlValue::Real(*f)),
                Value::Integer(i) => Ok(SqlValue::Real(*i as f64)),
                _ => reject("float"),
            },
            AttributeKind::Decimal { places } => match value {
                Value::Decimal(d) if d.places() == places => Ok(SqlValue::Integer(d.scaled())),
                Value::Decimal(d) => Err(EngineError::constraint(
                    &self.name,
                    format!(
                        "decimal precision mismatch: declared {places} places, got {}",
                        d.places()
                    ),
                )),
                Value::Integer(i) => Decimal::from_integer(*i, places)
                    .map(|d| SqlValue::Integer(d.scaled()))
                    .ok_or_else(|| {
                        EngineError::constraint(&self.name, "integer out of range for precision")
                    }),
                _ => reject("decimal"),
            },
            AttributeKind::Boolean => match value {
                Value::Boolean(b) => Ok(SqlValue::Integer(i64::from(*b))),
                _ => reject("boolean"),
            },
            AttributeKind::Text { .. } => match value {
                Value::Text(s) => {
                    if s.contains('\0') {
                        Err(EngineError::constraint(&self.name, "NUL byte in text"))
                    } else {
                        Ok(SqlValue::Text(s.clone()))
                    }
                }
                Value::Bytes(_) => reject("text"),
                _ => reject("text"),
            },
            AttributeKind::Bytes => match value {
                Value::Bytes(b) => Ok(SqlValue::Blob(b.clone())),
                Value::Text(_) => Err(EngineError::constraint(
                    &self.name,
                    "text where bytes expected",
                )),
                _ => reject("bytes"),
            },
            AttributeKind::Timestamp => match value {
                Value::Timestamp(t) => Ok(SqlValue::Integer(t.timestamp_micros())),
                _ => reject("timestamp"),
            },
            AttributeKind::Path => match value {
                Value::Path(p) => {
                    validate_relative_path(&self.name, p)?;
                    Ok(SqlValue::Text(p.clone()))
                }
                _ => reject("path"),
            },
            AttributeKind::TextList => match value {
                Value::TextList(items) => {
                    for item in items {
                        if item.contains(TEXT_LIST_SEPARATOR) || item.contains('\0') {
                            return Err(EngineError::constraint(
                                &self.name,
                                "list entry contains a reserved character",
                            ));
                        }
                    }
                    let mut encoded = String::new();
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            encoded.push(TEXT_LIST_SEPARATOR);
                        }
                        encoded.push_str(item);
                    }
                    Ok(SqlValue::Text(encoded))
                }
                _ => reject("textlist"),
            },
            AttributeKind::Reference { .. } => match value {
                Value::Reference(id) => Ok(SqlValue::Integer(id.as_i64())),
                _ => reject("reference"),
            },
        }
    }

    /// Decodes a storage value into its in-memory form.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Constraint`] when the stored value has the
    /// wrong storage class for this kind (a data-integrity failure).
    pub fn decode(&self, stored: &SqlValue) -> EngineResult<Value> {
        if stored.is_null() {
            return Ok(Value::Null);
        }
        let corrupt = || {
            Err(EngineError::constraint(
                &self.name,
                format!("stored value {stored} has the wrong storage class"),
            ))
        };
        match self.kind {
            AttributeKind::Integer => match stored.as_integer() {
                Some(i) => Ok(Value::Integer(i)),
                None => corrupt(),
            },
            AttributeKind::Float => match stored {
                SqlValue::Real(f) => Ok(Value::Float(*f)),
                SqlValue::Integer(i) => Ok(Value::Float(*i as f64)),
                _ => corrupt(),
            },
            AttributeKind::Decimal { places } => match stored.as_integer() {
                Some(scaled) => Ok(Value::Decimal(Decimal::from_scaled(scaled, places))),
                None => corrupt(),
            },
            AttributeKind::Boolean => match stored.as_integer() {
                Some(0) => Ok(Value::Boolean(false)),
                Some(1) => Ok(Value::Boolean(true)),
                _ => corrupt(),
            },
            AttributeKind::Text { .. } => match stored.as_text() {
                Some(s) => Ok(Value::Text(s.to_string())),
                None => corrupt(),
            },
            AttributeKind::Bytes => match stored.as_blob() {
                Some(b) => Ok(Value::Bytes(b.to_vec())),
                None => corrupt(),
            },
            AttributeKind::Timestamp => match stored.as_integer() {
                Some(micros) => match DateTime::from_timestamp_micros(micros) {
                    Some(t) => Ok(Value::Timestamp(t)),
                    None => corrupt(),
                },
                None => corrupt(),
            },
            AttributeKind::Path => match stored.as_text() {
                Some(p) => Ok(Value::Path(p.to_string())),
                None => corrupt(),
            },
            AttributeKind::TextList => match stored.as_text() {
                Some("") => Ok(Value::TextList(Vec::new())),
                Some(s) => Ok(Value::TextList(
                    s.split(TEXT_LIST_SEPARATOR).map(String::from).collect(),
                )),
                None => corrupt(),
            },
            AttributeKind::Reference { .. } => match stored.as_integer() {
                Some(id) => Ok(Value::Reference(StoreId::new(id))),
                None => corrupt(),
            },
        }
    }
}

/// Checks that a path value is relative, normalized, and `/`-separated.
fn validate_relative_path(attribute: &str, path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::constraint(attribute, "empty path"));
    }
    if path.contains('\0') {
        return Err(EngineError::constraint(attribute, "NUL byte in path"));
    }
    if path.contains('\\') {
        return Err(EngineError::constraint(
            attribute,
            "paths use '/' separators",
        ));
    }
    if path.starts_with('/') {
        return Err(EngineError::constraint(attribute, "path must be relative"));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(EngineError::constraint(
                attribute,
                format!("invalid path component {component:?}"),
            ));
        }
    }
    Ok(())
}
