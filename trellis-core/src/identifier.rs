//! Identifier normalization across integer and UUID primary keys.
//!
//! Identifiers reach this layer from untyped request input, so every
//! operation here is total: malformed or absent input degrades to
//! [`Identifier::Opaque`] (or `false`) instead of failing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("Invalid UUID regex")
});

static DIGITS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("Invalid digit regex"));

// ============================================================================
// IDENTIFIER
// ============================================================================

/// A classified identifier.
///
/// Classification is deterministic: UUID-shaped strings are `UuidString`,
/// integers and all-digit strings are `Integer`, everything else is `Opaque`.
/// The `Integer` variant keeps its original text so that `"0123"` is not
/// treated as the same identifier as `123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "String")]
pub enum Identifier {
    /// Integer key, with the text it was classified from.
    Integer { value: i64, raw: String },
    /// Canonical UUID string (case preserved).
    UuidString(String),
    /// Anything else, including the empty string for absent input.
    Opaque(String),
}

impl Identifier {
    /// Classify a raw string.
    pub fn classify(raw: &str) -> Self {
        if UUID_PATTERN.is_match(raw) {
            return Self::UuidString(raw.to_string());
        }
        if DIGITS_PATTERN.is_match(raw) {
            // Digit strings beyond i64 cannot be bound as integers.
            if let Ok(value) = raw.parse::<i64>() {
                return Self::Integer {
                    value,
                    raw: raw.to_string(),
                };
            }
        }
        Self::Opaque(raw.to_string())
    }

    /// Classify an untyped JSON value (as found in request bodies or rows).
    pub fn from_json(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::empty(),
            serde_json::Value::String(s) => Self::classify(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(value) => Self::from(value),
                None => Self::Opaque(n.to_string()),
            },
            other => Self::Opaque(other.to_string()),
        }
    }

    /// The identifier used for absent input.
    pub fn empty() -> Self {
        Self::Opaque(String::new())
    }

    /// String form used for equality and cache keys.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Integer { raw, .. } => raw,
            Self::UuidString(s) | Self::Opaque(s) => s,
        }
    }

    /// Returns true for the absent/empty identifier.
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    /// The integer value, if this is an integer identifier.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Parse into a UUID, if this is a UUID identifier.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::UuidString(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::Integer {
            value,
            raw: value.to_string(),
        }
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Self::from(i64::from(value))
    }
}

impl From<u32> for Identifier {
    fn from(value: u32) -> Self {
        Self::from(i64::from(value))
    }
}

impl From<&str> for Identifier {
    fn from(raw: &str) -> Self {
        Self::classify(raw)
    }
}

impl From<String> for Identifier {
    fn from(raw: String) -> Self {
        Self::classify(&raw)
    }
}

impl From<&String> for Identifier {
    fn from(raw: &String) -> Self {
        Self::classify(raw)
    }
}

impl From<Uuid> for Identifier {
    fn from(id: Uuid) -> Self {
        Self::UuidString(id.to_string())
    }
}

impl From<&serde_json::Value> for Identifier {
    fn from(raw: &serde_json::Value) -> Self {
        Self::from_json(raw)
    }
}

impl From<serde_json::Value> for Identifier {
    fn from(raw: serde_json::Value) -> Self {
        Self::from_json(&raw)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        match id {
            Identifier::Integer { raw, .. } => raw,
            Identifier::UuidString(s) | Identifier::Opaque(s) => s,
        }
    }
}

impl From<&Identifier> for Identifier {
    fn from(id: &Identifier) -> Self {
        id.clone()
    }
}

impl<T: Into<Identifier>> From<Option<T>> for Identifier {
    fn from(raw: Option<T>) -> Self {
        raw.map(Into::into).unwrap_or_default()
    }
}

// ============================================================================
// QUERY VALUES
// ============================================================================

/// A value ready to be bound as a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl QueryValue {
    /// Convert a JSON scalar into a bindable value. Arrays and objects are
    /// bound as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    /// String form, matching how identifiers compare.
    pub fn as_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    /// Compare against a stored JSON value using string forms. UUIDs
    /// compare case-insensitively, as they do once bound to a UUID column.
    pub fn matches_json(&self, stored: &serde_json::Value) -> bool {
        match (self, stored) {
            (Self::Null, serde_json::Value::Null) => true,
            (_, serde_json::Value::Null) | (Self::Null, _) => false,
            _ => match Identifier::from_json(stored) {
                Identifier::UuidString(uuid) => uuid.eq_ignore_ascii_case(&self.as_text()),
                other => other.as_str() == self.as_text(),
            },
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A single `field = value` criterion with a normalized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereCondition {
    pub field: String,
    pub value: QueryValue,
}

// ============================================================================
// ID KINDS
// ============================================================================

/// Primary-key representation of an entity's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// Integer (serial/bigserial) keys.
    Integer,
    /// UUID keys.
    Uuid,
    /// Free-form text keys.
    Text,
}

impl IdKind {
    /// Produce the bindable key for this kind, or `None` when the identifier
    /// can never match a key of this kind.
    pub fn coerce(self, id: &Identifier) -> Option<QueryValue> {
        if id.is_empty() {
            return None;
        }
        match (self, id) {
            (Self::Integer, Identifier::Integer { value, .. }) => Some(QueryValue::Integer(*value)),
            (Self::Integer, _) => None,
            (Self::Uuid, Identifier::UuidString(s)) => Some(QueryValue::Text(s.to_lowercase())),
            (Self::Uuid, _) => None,
            (Self::Text, other) => Some(QueryValue::Text(other.as_str().to_string())),
        }
    }
}

// ============================================================================
// NORMALIZER OPERATIONS
// ============================================================================

/// Compare two identifiers by their string forms.
pub fn equal(a: impl Into<Identifier>, b: impl Into<Identifier>) -> bool {
    a.into().as_str() == b.into().as_str()
}

/// True when the input is a UUID (any case).
pub fn is_uuid(raw: impl Into<Identifier>) -> bool {
    matches!(raw.into(), Identifier::UuidString(_))
}

/// True for integers and for strings made only of digits.
pub fn is_numeric(raw: impl Into<Identifier>) -> bool {
    match raw.into() {
        Identifier::Integer { .. } => true,
        other => DIGITS_PATTERN.is_match(other.as_str()),
    }
}

/// Normalize an identifier before it is embedded in a WHERE clause.
///
/// UUIDs pass through unchanged, digit strings become integers, and
/// anything else is bound as the raw text.
pub fn prepare_for_query(raw: impl Into<Identifier>) -> QueryValue {
    match raw.into() {
        Identifier::Integer { value, .. } => QueryValue::Integer(value),
        Identifier::UuidString(s) => QueryValue::Text(s),
        Identifier::Opaque(s) => QueryValue::Text(s),
    }
}

/// Build a normalized `field = value` condition.
pub fn to_where_condition(raw: impl Into<Identifier>, field: &str) -> WhereCondition {
    WhereCondition {
        field: field.to_string(),
        value: prepare_for_query(raw),
    }
}

/// Build a normalized `id = value` condition.
pub fn id_condition(raw: impl Into<Identifier>) -> WhereCondition {
    to_where_condition(raw, "id")
}

/// Whether a column name holds identifiers and should be normalized.
pub fn is_id_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id")
}
