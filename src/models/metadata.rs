//! Custom configuration parameters (guest-visible extra configuration)
//!
//! Values are declared with a scalar type, but the platform stores every
//! extra configuration entry as a string. Read-back is therefore lossy:
//! `num = 42` comes back as `"42"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A declared metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    /// String form written to extra configuration
    pub fn to_extra_config(&self) -> String {
        match self {
            MetadataValue::Bool(b) => b.to_string(),
            MetadataValue::Integer(i) => i.to_string(),
            MetadataValue::Float(f) => f.to_string(),
            MetadataValue::String(s) => s.clone(),
        }
    }

    /// Whether a string-typed read-back value corresponds to this one
    pub fn matches_read_back(&self, value: &str) -> bool {
        self.to_extra_config() == value
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Integer(i)
    }
}

impl From<i32> for MetadataValue {
    fn from(i: i32) -> Self {
        MetadataValue::Integer(i64::from(i))
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Declared custom configuration parameters, ordered by key
pub type Metadata = BTreeMap<String, MetadataValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_coercion() {
        assert_eq!(MetadataValue::from(42).to_extra_config(), "42");
        assert_eq!(MetadataValue::from("bar").to_extra_config(), "bar");
        assert_eq!(MetadataValue::from(true).to_extra_config(), "true");
        assert!(MetadataValue::from(42).matches_read_back("42"));
        assert!(!MetadataValue::from(42).matches_read_back("42.0"));
    }

    #[test]
    fn test_untagged_deserialize() {
        let metadata: Metadata =
            serde_json::from_str(r#"{"foo":"bar","car":"ferrari","num":42}"#).unwrap();
        assert_eq!(metadata["num"], MetadataValue::Integer(42));
        assert_eq!(metadata["foo"], MetadataValue::String("bar".into()));
        let keys: Vec<_> = metadata.keys().cloned().collect();
        assert_eq!(keys, vec!["car", "foo", "num"]);
    }
}
