//! Generic component identifier.
//!
//! This type provides a generic identifier for any pipeline component.
//! It is specialized as `DatasetKey` in sleet for ingestion datasets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generic identifier for any pipeline component.
///
/// This is a transparent wrapper around a String that provides
/// consistent identification semantics across the codebase.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    /// Create a new component key from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying identifier string.
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Derive a key from a filesystem or URI path.
    ///
    /// Extracts the last non-empty path segment as the key.
    /// Returns "default" if no valid segment can be extracted.
    ///
    /// # Examples
    ///
    /// ```
    /// use sleet_common::config::ComponentKey;
    ///
    /// assert_eq!(ComponentKey::from_path("/data/edgar/submissions").id(), "submissions");
    /// assert_eq!(ComponentKey::from_path("/data/edgar/submissions/").id(), "submissions");
    /// assert_eq!(ComponentKey::from_path("").id(), "default");
    /// ```
    pub fn from_path(path: &str) -> Self {
        // Strip scheme if present (e.g., "file://")
        let path = path.find("://").map(|i| &path[i + 3..]).unwrap_or(path);

        let key = path
            .trim_end_matches('/')
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("default");

        Self(key.to_string())
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ComponentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
