//! Documents and collection addressing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

/// A stored document: a JSON object with a unique `_id` field.
pub type Document = Map<String, Value>;

/// Name of the primary-key field every document carries.
pub const ID_FIELD: &str = "_id";

/// Address of one collection inside one logical database.
///
/// Project data lives in a database named after the project id; system
/// collections live in [`SYSTEM_DATABASE`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId {
    pub database: String,
    pub name: String,
}

/// Database holding the project registry and lock records.
pub const SYSTEM_DATABASE: &str = "_system";

impl CollectionId {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self::new(SYSTEM_DATABASE, name)
    }
}

impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.name)
    }
}

/// Look up a possibly dotted field path (`settings.theme`) in a document.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The `_id` of a document, if present.
pub fn document_id(document: &Document) -> Option<&Value> {
    document.get(ID_FIELD)
}

/// Human-readable rendering of an `_id` value for error messages.
pub fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Integer field accessor that tolerates integral floats.
pub fn get_i64(document: &Document, field: &str) -> Option<i64> {
    match document.get(field)? {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

/// Loose JSON equality: numbers compare by value regardless of int/float
/// representation, everything else structurally.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else {
                match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => a == b,
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_dotted_paths() {
        let doc = json!({"settings": {"theme": "dark"}, "name": "p"})
            .as_object()
            .cloned()
            .expect("object literal");
        assert_eq!(lookup(&doc, "settings.theme"), Some(&json!("dark")));
        assert_eq!(lookup(&doc, "settings.missing"), None);
        assert_eq!(lookup(&doc, "name.inner"), None);
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(3), &json!(3.0)));
        assert!(!values_equal(&json!(3), &json!(3.5)));
        assert!(values_equal(&json!([1, 2.0]), &json!([1.0, 2])));
    }

    #[test]
    fn get_i64_accepts_integral_floats() {
        let doc = json!({"a": 4.0, "b": 4.5, "c": "4"})
            .as_object()
            .cloned()
            .expect("object literal");
        assert_eq!(get_i64(&doc, "a"), Some(4));
        assert_eq!(get_i64(&doc, "b"), None);
        assert_eq!(get_i64(&doc, "c"), None);
    }
}
