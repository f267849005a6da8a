//! Field-name normalization mapping.
//!
//! An external mapping from raw field names to normalized field names,
//! loaded once at startup and treated as read-only for the run. Parse
//! workers apply it once per record to top-level document keys.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::ConfigError;
use sleet_common::error::{ReadFileSnafu, YamlParseSnafu};

/// Immutable raw -> normalized field-name mapping.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    names: HashMap<String, String>,
}

impl FieldMapping {
    /// An empty mapping that leaves every field name untouched.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Load a mapping from a YAML file of `raw: normalized` pairs.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        let names: HashMap<String, String> =
            serde_yaml::from_str(&contents).context(YamlParseSnafu)?;
        Ok(Self { names })
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Normalize a single field name.
    pub fn normalize<'a>(&'a self, raw: &'a str) -> &'a str {
        self.names.get(raw).map(String::as_str).unwrap_or(raw)
    }

    /// Rename the top-level keys of a document in place.
    ///
    /// Unmapped keys pass through unchanged. When a raw key maps onto a
    /// name that already exists, the mapped value wins.
    pub fn apply(&self, document: &mut Value) {
        if self.names.is_empty() {
            return;
        }
        let Value::Object(object) = document else {
            return;
        };

        let mut normalized = Map::with_capacity(object.len());
        for (key, value) in std::mem::take(object) {
            let name = self.normalize(&key).to_string();
            normalized.insert(name, value);
        }
        *object = normalized;
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            names: pairs
                .iter()
                .map(|(raw, normalized)| (raw.to_string(), normalized.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_leaves_document_unchanged() {
        let mapping = FieldMapping::identity();
        let mut doc = json!({"cik": "0000320193", "entityName": "Apple Inc."});
        let original = doc.clone();
        mapping.apply(&mut doc);
        assert_eq!(doc, original);
    }

    #[test]
    fn test_renames_top_level_keys() {
        let mapping = FieldMapping::from_pairs(&[("entityName", "entity_name")]);
        let mut doc = json!({"cik": "1", "entityName": "Apple Inc."});
        mapping.apply(&mut doc);
        assert_eq!(doc, json!({"cik": "1", "entity_name": "Apple Inc."}));
    }

    #[test]
    fn test_nested_keys_untouched() {
        let mapping = FieldMapping::from_pairs(&[("facts", "normalized_facts")]);
        let mut doc = json!({"facts": {"facts": 1}});
        mapping.apply(&mut doc);
        assert_eq!(doc, json!({"normalized_facts": {"facts": 1}}));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.yaml");
        std::fs::write(&path, "entityName: entity_name\nsic: sic_code\n").unwrap();

        let mapping = FieldMapping::from_file(&path).unwrap();
        assert_eq!(mapping.normalize("entityName"), "entity_name");
        assert_eq!(mapping.normalize("sic"), "sic_code");
        assert_eq!(mapping.normalize("cik"), "cik");
    }

    #[test]
    fn test_from_file_missing() {
        assert!(FieldMapping::from_file("/nonexistent/mapping.yaml").is_err());
    }
}
