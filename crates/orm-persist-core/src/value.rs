//! Dynamic SQL values.

use serde::{Deserialize, Serialize};

/// A dynamically-typed SQL value.
///
/// Entities expose their properties as `Value`s, and every statement handed
/// to a query runner binds its parameters as `Value`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch, UTC)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Decimal(s) | Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `Some(self)` unless the value is NULL.
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }

    /// The value a version column takes after one more write.
    ///
    /// A missing or non-numeric current version counts as 0, so the first
    /// bump of an unversioned row yields 1.
    #[must_use]
    pub fn next_version(current: Option<&Value>) -> Value {
        let current = current.and_then(Value::as_i64).unwrap_or(0);
        Value::BigInt(current.saturating_add(1))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_checks() {
        assert!(Value::Null.is_null());
        assert!(!Value::BigInt(0).is_null());
        assert_eq!(Value::Null.non_null(), None);
        assert_eq!(Value::Int(3).non_null(), Some(Value::Int(3)));
    }

    #[test]
    fn test_as_i64_conversions() {
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::BigInt(-2).as_i64(), Some(-2));
        assert_eq!(Value::Text("41".into()).as_i64(), Some(41));
        assert_eq!(Value::Text("x".into()).as_i64(), None);
        assert_eq!(Value::Double(1.0).as_i64(), None);
    }

    #[test]
    fn test_next_version() {
        assert_eq!(Value::next_version(None), Value::BigInt(1));
        assert_eq!(Value::next_version(Some(&Value::Null)), Value::BigInt(1));
        assert_eq!(Value::next_version(Some(&Value::Int(4))), Value::BigInt(5));
        assert_eq!(
            Value::next_version(Some(&Value::BigInt(i64::MAX))),
            Value::BigInt(i64::MAX)
        );
    }

    #[test]
    fn test_option_into_value() {
        let some: Value = Some(5_i64).into();
        let none: Value = Option::<i64>::None.into();
        assert_eq!(some, Value::BigInt(5));
        assert_eq!(none, Value::Null);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Timestamp(0).type_name(), "TIMESTAMP");
        assert_eq!(Value::Json(serde_json::json!({})).type_name(), "JSON");
    }
}
