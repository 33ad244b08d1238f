//! Declarative selection predicates over documents.
//!
//! Boolean AND/OR/NOT over equality, set membership and field existence.
//! Ordered comparisons exist only for timestamp ranges. Semantics follow
//! MongoDB query operators so a filter can be handed to a document database
//! unchanged:
//! - equality against an array field matches when the array contains the value
//! - `$nin` on a missing field is satisfied
//! - equality with `null` matches a missing field

use crate::document::{Document, lookup, values_equal};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Exists { field: String, exists: bool },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::NotIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Self::Exists {
            field: field.into(),
            exists,
        }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction; `All` operands are dropped and a single operand is unwrapped.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut operands: Vec<Filter> = filters
            .into_iter()
            .filter(|f| !matches!(f, Filter::All))
            .collect();
        match operands.len() {
            0 => Filter::All,
            1 => operands.remove(0),
            _ => Filter::And(operands),
        }
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut operands: Vec<Filter> = filters.into_iter().collect();
        if operands.len() == 1 {
            return operands.remove(0);
        }
        Filter::Or(operands)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Evaluate the predicate against one document.
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => field_equals(document, field, value),
            Filter::Ne { field, value } => !field_equals(document, field, value),
            Filter::In { field, values } => values.iter().any(|v| field_equals(document, field, v)),
            Filter::NotIn { field, values } => {
                !values.iter().any(|v| field_equals(document, field, v))
            }
            Filter::Exists { field, exists } => lookup(document, field).is_some() == *exists,
            Filter::Gte { field, value } => matches!(
                lookup(document, field).and_then(|v| compare(v, value)),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt { field, value } => matches!(
                lookup(document, field).and_then(|v| compare(v, value)),
                Some(Ordering::Less)
            ),
            Filter::And(filters) => filters.iter().all(|f| f.matches(document)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(document)),
            Filter::Not(inner) => !inner.matches(document),
        }
    }

    /// Equality constraints that hold for every matching document.
    ///
    /// Used to seed a new document when an update upserts.
    pub fn equality_fields(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Eq { field, value } => vec![(field.as_str(), value)],
            Filter::And(filters) => filters.iter().flat_map(Filter::equality_fields).collect(),
            _ => Vec::new(),
        }
    }

    /// Canonical MongoDB-style JSON rendering.
    pub fn to_json(&self) -> Value {
        match self {
            Filter::All => Value::Object(Map::new()),
            Filter::Eq { field, value } => json!({ field: value }),
            Filter::Ne { field, value } => json!({ field: { "$ne": value } }),
            Filter::In { field, values } => json!({ field: { "$in": values } }),
            Filter::NotIn { field, values } => json!({ field: { "$nin": values } }),
            Filter::Exists { field, exists } => json!({ field: { "$exists": exists } }),
            Filter::Gte { field, value } => json!({ field: { "$gte": value } }),
            Filter::Lt { field, value } => json!({ field: { "$lt": value } }),
            Filter::And(filters) => {
                json!({ "$and": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(filters) => {
                json!({ "$or": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Not(inner) => json!({ "$nor": [inner.to_json()] }),
        }
    }
}

fn field_equals(document: &Document, field: &str, expected: &Value) -> bool {
    match lookup(document, field) {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(actual) => values_equal(actual, expected),
    }
}

fn compare(actual: &Value, bound: &Value) -> Option<Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                Some(a.cmp(&b))
            } else {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
