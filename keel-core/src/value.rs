//! Field values, tuples, and derived key values

use crate::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A single field value.
///
/// Equality, ordering, and hashing are structural so values can be used
/// as index key components. Floating point is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Id(Uuid),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Id(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Id(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Raw record data as delivered by a backing store or written by a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    identity: Identity,
    fields: BTreeMap<String, FieldValue>,
}

impl Tuple {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            fields: BTreeMap::new(),
        }
    }

    /// Set a field, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Field value, `None` when the field is absent.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Derived key produced by projecting a tuple onto an index definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyValue(Vec<FieldValue>);

impl KeyValue {
    pub fn new(parts: Vec<FieldValue>) -> Self {
        Self(parts)
    }

    /// Single-component key.
    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn parts(&self) -> &[FieldValue] {
        &self.0
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", part)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_builder_and_get() {
        let id = Identity::new();
        let tuple = Tuple::new(id).with("email", "a@x.com").with("age", 42i64);
        assert_eq!(tuple.identity(), id);
        assert_eq!(tuple.get("email"), Some(&FieldValue::Text("a@x.com".to_string())));
        assert_eq!(tuple.get("age").and_then(FieldValue::as_int), Some(42));
        assert!(tuple.get("missing").is_none());
    }

    #[test]
    fn test_key_value_structural_equality() {
        let a = KeyValue::new(vec!["x".into(), 1i64.into()]);
        let b = KeyValue::new(vec![FieldValue::Text("x".to_string()), FieldValue::Int(1)]);
        assert_eq!(a, b);
        assert_ne!(a, KeyValue::single("x"));
    }

    #[test]
    fn test_key_value_display() {
        let key = KeyValue::new(vec!["a@x.com".into(), FieldValue::Null]);
        assert_eq!(key.to_string(), "(\"a@x.com\", null)");
    }

    #[test]
    fn test_option_into_field_value() {
        let none: Option<&str> = None;
        assert!(FieldValue::from(none).is_null());
        assert_eq!(FieldValue::from(Some(3i64)), FieldValue::Int(3));
    }
}
