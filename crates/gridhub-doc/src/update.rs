//! Projections and single-document update operators.

use crate::document::{Document, ID_FIELD, values_equal};
use crate::error::BackendError;
use serde_json::Value;

/// Field selection applied to query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    All,
    /// Keep only these top-level fields (plus `_id`).
    Include(Vec<String>),
    /// Drop these top-level fields.
    Exclude(Vec<String>),
}

impl Projection {
    pub fn include<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Include(fields.into_iter().map(Into::into).collect())
    }

    pub fn exclude<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Exclude(fields.into_iter().map(Into::into).collect())
    }

    pub fn apply(&self, document: &Document) -> Document {
        match self {
            Projection::All => document.clone(),
            Projection::Include(fields) => document
                .iter()
                .filter(|(key, _)| key.as_str() == ID_FIELD || fields.iter().any(|f| f == *key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Projection::Exclude(fields) => document
                .iter()
                .filter(|(key, _)| !fields.iter().any(|f| f == *key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// One atomic modification of a single document field.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    /// Append to an array field unless an equal element is already present.
    AddToSet(String, Value),
    /// Remove every equal element from an array field.
    Pull(String, Value),
    Inc(String, i64),
    /// Raise an integer field to at least the given value.
    Max(String, i64),
}

impl UpdateOp {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set(field.into(), value.into())
    }

    fn field(&self) -> &str {
        match self {
            UpdateOp::Set(f, _)
            | UpdateOp::Unset(f)
            | UpdateOp::AddToSet(f, _)
            | UpdateOp::Pull(f, _)
            | UpdateOp::Inc(f, _)
            | UpdateOp::Max(f, _) => f,
        }
    }
}

/// Apply operators in order. The document is left untouched on error.
pub fn apply_updates(document: &mut Document, ops: &[UpdateOp]) -> Result<(), BackendError> {
    let mut next = document.clone();
    for op in ops {
        if op.field() == ID_FIELD {
            return Err(BackendError::InvalidDocument(
                "the _id field cannot be updated".to_string(),
            ));
        }
        match op {
            UpdateOp::Set(field, value) => {
                next.insert(field.clone(), value.clone());
            }
            UpdateOp::Unset(field) => {
                next.remove(field);
            }
            UpdateOp::AddToSet(field, value) => match next.get_mut(field) {
                None | Some(Value::Null) => {
                    next.insert(field.clone(), Value::Array(vec![value.clone()]));
                }
                Some(Value::Array(items)) => {
                    if !items.iter().any(|item| values_equal(item, value)) {
                        items.push(value.clone());
                    }
                }
                Some(_) => return Err(not_an_array(field)),
            },
            UpdateOp::Pull(field, value) => match next.get_mut(field) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => items.retain(|item| !values_equal(item, value)),
                Some(_) => return Err(not_an_array(field)),
            },
            UpdateOp::Inc(field, by) => {
                let current = integer_field(&next, field)?.unwrap_or(0);
                let incremented = current.checked_add(*by).ok_or_else(|| {
                    BackendError::InvalidDocument(format!("field `{field}` would overflow"))
                })?;
                next.insert(field.clone(), Value::from(incremented));
            }
            UpdateOp::Max(field, floor) => {
                let current = integer_field(&next, field)?;
                if current.is_none_or(|c| c < *floor) {
                    next.insert(field.clone(), Value::from(*floor));
                }
            }
        }
    }
    *document = next;
    Ok(())
}

fn integer_field(document: &Document, field: &str) -> Result<Option<i64>, BackendError> {
    match document.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            BackendError::InvalidDocument(format!("field `{field}` is not an integer"))
        }),
        Some(_) => Err(BackendError::InvalidDocument(format!(
            "field `{field}` is not an integer"
        ))),
    }
}

fn not_an_array(field: &str) -> BackendError {
    BackendError::InvalidDocument(format!("field `{field}` is not an array"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let mut d = doc(json!({"_id": "b:0:1"}));
        let ops = [UpdateOp::AddToSet("not_in_var".to_string(), json!(2))];
        apply_updates(&mut d, &ops).expect("first add");
        apply_updates(&mut d, &ops).expect("second add");
        assert_eq!(d["not_in_var"], json!([2]));
    }

    #[test]
    fn pull_removes_matching_elements() {
        let mut d = doc(json!({"_id": 1, "not_in_var": [1, 2, 1]}));
        apply_updates(&mut d, &[UpdateOp::Pull("not_in_var".to_string(), json!(1))])
            .expect("pull");
        assert_eq!(d["not_in_var"], json!([2]));
    }

    #[test]
    fn inc_and_max_drive_counters() {
        let mut d = doc(json!({"_id": "counter"}));
        apply_updates(&mut d, &[UpdateOp::Inc("seq".to_string(), 1)]).expect("inc");
        assert_eq!(d["seq"], json!(1));
        apply_updates(&mut d, &[UpdateOp::Max("seq".to_string(), 7)]).expect("max");
        apply_updates(&mut d, &[UpdateOp::Max("seq".to_string(), 3)]).expect("max lower");
        assert_eq!(d["seq"], json!(7));
    }

    #[test]
    fn inc_past_i64_max_is_rejected() {
        let mut d = doc(json!({"_id": "counter", "seq": i64::MAX}));
        let err = apply_updates(&mut d, &[UpdateOp::Inc("seq".to_string(), 1)])
            .expect_err("overflow");
        assert!(matches!(err, BackendError::InvalidDocument(_)));
        assert_eq!(d["seq"], json!(i64::MAX));
    }

    #[test]
    fn failed_update_leaves_document_unchanged() {
        let mut d = doc(json!({"_id": 1, "name": "x"}));
        let err = apply_updates(
            &mut d,
            &[
                UpdateOp::set("a", 1),
                UpdateOp::AddToSet("name".to_string(), json!(1)),
            ],
        )
        .expect_err("string field is not an array");
        assert!(matches!(err, BackendError::InvalidDocument(_)));
        assert!(!d.contains_key("a"));
    }

    #[test]
    fn include_projection_keeps_id() {
        let d = doc(json!({"_id": 1, "a": 1, "b": 2}));
        let projected = Projection::include(["a"]).apply(&d);
        assert_eq!(Value::Object(projected), json!({"_id": 1, "a": 1}));
    }
}
