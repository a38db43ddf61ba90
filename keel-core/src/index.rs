//! Secondary index definitions

use crate::{FieldValue, KeyValue, Tuple};
use serde::{Deserialize, Serialize};

/// Defines one secondary index as a projection of tuple fields.
///
/// Indexes are identified by name within one entity cache. A missing field
/// projects to [`FieldValue::Null`], so absent and null are the same key
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    name: String,
    fields: Vec<String>,
    unique: bool,
}

impl IndexDefinition {
    /// Non-unique index over the given fields.
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Unique index over the given fields: at most one record per key.
    pub fn unique<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unique: true,
            ..Self::new(name, fields)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Project a tuple onto this index's key.
    pub fn extract(&self, tuple: &Tuple) -> KeyValue {
        KeyValue::new(
            self.fields
                .iter()
                .map(|field| tuple.get(field).cloned().unwrap_or(FieldValue::Null))
                .collect(),
        )
    }

    /// Whether `tuple` belongs under `key` for this index.
    pub fn matches(&self, tuple: &Tuple, key: &KeyValue) -> bool {
        self.fields.len() == key.parts().len()
            && self
                .fields
                .iter()
                .zip(key.parts())
                .all(|(field, part)| tuple.get(field).unwrap_or(&FieldValue::Null) == part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Identity;

    #[test]
    fn test_extract_projects_fields_in_order() {
        let index = IndexDefinition::new("by_name", ["last", "first"]);
        let tuple = Tuple::new(Identity::new())
            .with("first", "Ada")
            .with("last", "Lovelace");
        assert_eq!(
            index.extract(&tuple),
            KeyValue::new(vec!["Lovelace".into(), "Ada".into()])
        );
    }

    #[test]
    fn test_missing_field_extracts_null() {
        let index = IndexDefinition::unique("email", ["email"]);
        let tuple = Tuple::new(Identity::new());
        assert_eq!(index.extract(&tuple), KeyValue::new(vec![FieldValue::Null]));
        assert!(index.is_unique());
    }

    #[test]
    fn test_matches_agrees_with_extract() {
        let index = IndexDefinition::new("region", ["region"]);
        let tuple = Tuple::new(Identity::new()).with("region", "eu");
        assert!(index.matches(&tuple, &KeyValue::single("eu")));
        assert!(!index.matches(&tuple, &KeyValue::single("us")));
        assert!(!index.matches(&tuple, &KeyValue::new(vec!["eu".into(), "x".into()])));
    }
}
