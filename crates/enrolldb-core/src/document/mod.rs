//! Semi-structured document values.
//!
//! Metadata and detail bags are schema-less. They are modelled as a tagged
//! union that serializes to plain JSON, and stored as an opaque blob inside
//! the owning row. Indexing works on two derived views:
//!
//! - [`Document::paths`] flattens leaves into `(path, scalar)` pairs for
//!   structural containment lookups.
//! - [`Document::tokens`] tokenizes the serialized form for full-text search.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::IndexValue;

/// Path segment used for array elements.
pub const ARRAY_SEGMENT: &str = "[]";

/// A JSON-like value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Document {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Document>),
    Object(BTreeMap<String, Document>),
}

impl Document {
    /// An empty object bag.
    pub fn object() -> Self {
        Document::Object(BTreeMap::new())
    }

    /// Add a key to an object document. Non-objects are replaced by an object.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Document>) -> Self {
        if !matches!(self, Document::Object(_)) {
            self = Document::object();
        }
        if let Document::Object(map) = &mut self {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Document::Object(_))
    }

    /// Look up a direct child of an object.
    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Document::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Flatten leaves into `(path, scalar)` pairs.
    ///
    /// Object keys are joined with `.`; array elements contribute the
    /// [`ARRAY_SEGMENT`] so that containment does not depend on position.
    /// Empty objects and arrays produce no leaves.
    pub fn paths(&self) -> Vec<(String, IndexValue)> {
        let mut out = Vec::new();
        collect_paths(self, String::new(), &mut out);
        out.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        });
        out.dedup();
        out
    }

    /// Distinct tokens of the serialized representation.
    pub fn tokens(&self) -> BTreeSet<String> {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        tokenize(&serialized).into_iter().collect()
    }

    /// Structural containment: every key of `pattern` exists here with a
    /// containing value, every element of a pattern array is contained by
    /// some element of the matching array, and scalars are equal.
    pub fn contains(&self, pattern: &Document) -> bool {
        match (self, pattern) {
            (Document::Object(have), Document::Object(want)) => want
                .iter()
                .all(|(k, v)| have.get(k).is_some_and(|h| h.contains(v))),
            (Document::Array(have), Document::Array(want)) => want
                .iter()
                .all(|w| have.iter().any(|h| h.contains(w))),
            (a, b) => a == b,
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Document::object()
    }
}

fn collect_paths(doc: &Document, path: String, out: &mut Vec<(String, IndexValue)>) {
    match doc {
        Document::Object(map) => {
            for (key, value) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                collect_paths(value, child, out);
            }
        }
        Document::Array(items) => {
            let child = if path.is_empty() {
                ARRAY_SEGMENT.to_string()
            } else {
                format!("{}.{}", path, ARRAY_SEGMENT)
            };
            for item in items {
                collect_paths(item, child.clone(), out);
            }
        }
        Document::Null => out.push((path, IndexValue::Null)),
        Document::Bool(b) => out.push((path, IndexValue::Bool(*b))),
        Document::Number(n) => out.push((path, number_value(*n))),
        Document::String(s) => out.push((path, IndexValue::Text(s.clone()))),
    }
}

/// Integral numbers index as integers so that `3` and `3.0` agree.
fn number_value(n: f64) -> IndexValue {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        IndexValue::Int(n as i64)
    } else {
        IndexValue::Float(n)
    }
}

/// Lowercase alphanumeric tokens of `text`, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Document::Null,
            serde_json::Value::Bool(b) => Document::Bool(b),
            serde_json::Value::Number(n) => Document::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Document::String(s),
            serde_json::Value::Array(items) => {
                Document::Array(items.into_iter().map(Document::from).collect())
            }
            serde_json::Value::Object(map) => Document::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Document::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Document {
    fn from(s: &str) -> Self {
        Document::String(s.to_string())
    }
}

impl From<String> for Document {
    fn from(s: String) -> Self {
        Document::String(s)
    }
}

impl From<bool> for Document {
    fn from(b: bool) -> Self {
        Document::Bool(b)
    }
}

impl From<f64> for Document {
    fn from(n: f64) -> Self {
        Document::Number(n)
    }
}

impl From<i64> for Document {
    fn from(n: i64) -> Self {
        Document::Number(n as f64)
    }
}

impl<T: Into<Document>> From<Vec<T>> for Document {
    fn from(items: Vec<T>) -> Self {
        Document::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        Document::from(json!({
            "interests": ["Math", "chess"],
            "address": {"city": "Porto", "zip": 4000},
            "scholarship": true
        }))
    }

    #[test]
    fn test_paths_flatten_nested_values() {
        let paths = sample().paths();
        assert!(paths.contains(&("address.city".into(), IndexValue::Text("Porto".into()))));
        assert!(paths.contains(&("address.zip".into(), IndexValue::Int(4000))));
        assert!(paths.contains(&("interests.[]".into(), IndexValue::Text("chess".into()))));
        assert!(paths.contains(&("scholarship".into(), IndexValue::Bool(true))));
        assert_eq!(paths.len(), 5);
    }

    #[test]
    fn test_repeated_array_elements_yield_one_leaf() {
        let doc = Document::from(json!({"tags": ["a", "b", "a"]}));
        assert_eq!(
            doc.paths(),
            vec![
                ("tags.[]".to_string(), IndexValue::Text("a".into())),
                ("tags.[]".to_string(), IndexValue::Text("b".into())),
            ]
        );
    }

    #[test]
    fn test_empty_containers_have_no_leaves() {
        let doc = Document::from(json!({"tags": [], "extra": {}}));
        assert!(doc.paths().is_empty());
    }

    #[test]
    fn test_containment() {
        let doc = sample();
        assert!(doc.contains(&Document::from(json!({"address": {"city": "Porto"}}))));
        assert!(doc.contains(&Document::from(json!({"interests": ["chess"]}))));
        assert!(doc.contains(&Document::object()));
        assert!(!doc.contains(&Document::from(json!({"address": {"city": "Lisbon"}}))));
        assert!(!doc.contains(&Document::from(json!({"interests": ["go"]}))));
        assert!(!doc.contains(&Document::from(json!({"missing": 1}))));
    }

    #[test]
    fn test_tokens_cover_keys_and_values() {
        let tokens = sample().tokens();
        assert!(tokens.contains("math"));
        assert!(tokens.contains("interests"));
        assert!(tokens.contains("porto"));
        assert!(!tokens.contains("Math"));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Applied MATH, year-2"), vec!["applied", "math", "year", "2"]);
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_json_roundtrip_is_plain() {
        let doc = Document::object().with("grade", 7i64).with("club", "robotics");
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, json!({"club": "robotics", "grade": 7.0}));

        let back: Document = serde_json::from_value(json!({"a": [1, null, "x"]})).unwrap();
        assert_eq!(
            back,
            Document::Object(BTreeMap::from([(
                "a".to_string(),
                Document::Array(vec![
                    Document::Number(1.0),
                    Document::Null,
                    Document::String("x".into())
                ])
            )]))
        );
    }
}
