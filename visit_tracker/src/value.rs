//! Scalar values stored in visit columns.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single visit column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Integer(i64),
    String(String),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

/// The storage kind a schema column declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    String,
    Timestamp,
    Boolean,
}

impl AttributeValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AttributeValue::Integer(_) => ValueKind::Integer,
            AttributeValue::String(_) => ValueKind::String,
            AttributeValue::Timestamp(_) => ValueKind::Timestamp,
            AttributeValue::Boolean(_) => ValueKind::Boolean,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts the value into `kind` when that is lossless.
    ///
    /// Row stores commonly hand back booleans as `0`/`1` and timestamps as
    /// epoch seconds; both forms are accepted so that a loaded row and a value
    /// written during processing compare equal when they mean the same thing.
    pub fn coerce(self, kind: ValueKind) -> Result<AttributeValue, String> {
        match (self, kind) {
            (v, k) if v.kind() == k => Ok(v),
            (AttributeValue::Integer(0), ValueKind::Boolean) => Ok(AttributeValue::Boolean(false)),
            (AttributeValue::Integer(1), ValueKind::Boolean) => Ok(AttributeValue::Boolean(true)),
            (AttributeValue::Integer(secs), ValueKind::Timestamp) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(AttributeValue::Timestamp)
                .ok_or_else(|| format!("{} is out of range for a timestamp", secs)),
            (v, k) => Err(format!("expected {:?} value, got {:?}", k, v.kind())),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::String(v) => write!(f, "{:?}", v),
            AttributeValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            AttributeValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Boolean(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttributeValue::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_boolean_from_integer() {
        assert_eq!(
            AttributeValue::Integer(1).coerce(ValueKind::Boolean),
            Ok(AttributeValue::Boolean(true))
        );
        assert_eq!(
            AttributeValue::Integer(0).coerce(ValueKind::Boolean),
            Ok(AttributeValue::Boolean(false))
        );
        assert!(AttributeValue::Integer(2).coerce(ValueKind::Boolean).is_err());
    }

    #[test]
    fn test_coerce_timestamp_from_epoch_seconds() {
        let ts = Utc.timestamp_opt(1_000, 0).unwrap();
        assert_eq!(
            AttributeValue::Integer(1_000).coerce(ValueKind::Timestamp),
            Ok(AttributeValue::Timestamp(ts))
        );
    }

    #[test]
    fn test_coerce_rejects_strings_for_integers() {
        let err = AttributeValue::from("42").coerce(ValueKind::Integer).unwrap_err();
        assert!(err.contains("Integer"));
    }
}
