//! Variant overlay predicates.
//!
//! Every element document is tagged with how it relates to the base dataset:
//!
//! ```text
//! base      var_type = "base" (or absent), not_in_var = [variants suppressing it]
//! change    var_type = "change",   variant = V   overrides base row `index` in V
//! addition  var_type = "addition", variant = V   exists only in V
//! ```
//!
//! The filter built here selects, in one backend query, every document that
//! is active in a variant context. A base row and its change both match; the
//! read path resolves that with [`dedupe_by_index`].

use crate::error::{Result, StoreError};
use gridhub_doc::{BackendError, Document, Filter, get_i64};
use gridhub_table::INDEX_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

pub const VAR_TYPE_FIELD: &str = "var_type";
pub const VARIANT_FIELD: &str = "variant";
pub const NOT_IN_VAR_FIELD: &str = "not_in_var";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Base,
    Change,
    Addition,
}

impl VarType {
    pub fn as_str(self) -> &'static str {
        match self {
            VarType::Base => "base",
            VarType::Change => "change",
            VarType::Addition => "addition",
        }
    }
}

impl Display for VarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The overlay tag of one stored element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementVariant {
    Base { not_in_var: Vec<i64> },
    Change { variant: i64 },
    Addition { variant: i64 },
}

impl ElementVariant {
    pub fn var_type(&self) -> VarType {
        match self {
            ElementVariant::Base { .. } => VarType::Base,
            ElementVariant::Change { .. } => VarType::Change,
            ElementVariant::Addition { .. } => VarType::Addition,
        }
    }

    pub fn variant(&self) -> Option<i64> {
        match self {
            ElementVariant::Base { .. } => None,
            ElementVariant::Change { variant } | ElementVariant::Addition { variant } => {
                Some(*variant)
            }
        }
    }

    /// Read the tag of a stored document. A missing `var_type` means base.
    pub fn from_document(document: &Document) -> Result<Self> {
        let var_type = match document.get(VAR_TYPE_FIELD) {
            None | Some(Value::Null) => VarType::Base,
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                BackendError::InvalidDocument(format!("unknown var_type {value}"))
            })?,
        };
        let variant = || {
            get_i64(document, VARIANT_FIELD).ok_or_else(|| {
                StoreError::from(BackendError::InvalidDocument(format!(
                    "{var_type} element without integer variant"
                )))
            })
        };
        Ok(match var_type {
            VarType::Base => ElementVariant::Base {
                not_in_var: document
                    .get(NOT_IN_VAR_FIELD)
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default(),
            },
            VarType::Change => ElementVariant::Change {
                variant: variant()?,
            },
            VarType::Addition => ElementVariant::Addition {
                variant: variant()?,
            },
        })
    }

    /// Write the tag fields into a document.
    pub fn apply_to(&self, document: &mut Document) {
        document.insert(
            VAR_TYPE_FIELD.to_string(),
            Value::String(self.var_type().as_str().to_string()),
        );
        match self {
            ElementVariant::Base { not_in_var } => {
                document.remove(VARIANT_FIELD);
                document.insert(NOT_IN_VAR_FIELD.to_string(), Value::from(not_in_var.clone()));
            }
            ElementVariant::Change { variant } | ElementVariant::Addition { variant } => {
                document.remove(NOT_IN_VAR_FIELD);
                document.insert(VARIANT_FIELD.to_string(), Value::from(*variant));
            }
        }
    }
}

/// Which overlay a read resolves against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VariantContext {
    #[default]
    BaseOnly,
    Variants(Vec<i64>),
}

impl VariantContext {
    pub fn variant(variant: i64) -> Self {
        Self::Variants(vec![variant])
    }

    /// The single requested variant, `None` for base-only.
    ///
    /// An empty variant list means base-only. More than one variant is
    /// rejected: overlapping changes have no defined precedence.
    pub fn single(&self) -> Result<Option<i64>> {
        match self {
            VariantContext::BaseOnly => Ok(None),
            VariantContext::Variants(variants) => match variants.as_slice() {
                [] => Ok(None),
                [variant] => Ok(Some(*variant)),
                many => Err(StoreError::invalid(format!(
                    "reading several variants at once is not supported (requested {many:?})"
                ))),
            },
        }
    }
}

impl From<Option<i64>> for VariantContext {
    fn from(variant: Option<i64>) -> Self {
        match variant {
            Some(v) => Self::variant(v),
            None => Self::BaseOnly,
        }
    }
}

/// Documents of the base dataset: `var_type` absent or `base`.
pub fn base_clause() -> Filter {
    Filter::or([
        Filter::exists(VAR_TYPE_FIELD, false),
        Filter::eq(VAR_TYPE_FIELD, VarType::Base.as_str()),
    ])
}

/// Build the predicate selecting every document active in `requested`.
pub fn build_filter(requested: &VariantContext) -> Result<Filter> {
    let Some(variant) = requested.single()? else {
        return Ok(base_clause());
    };
    Ok(Filter::or([
        Filter::and([base_clause(), Filter::not_in(NOT_IN_VAR_FIELD, [variant])]),
        Filter::and([
            Filter::is_in(
                VAR_TYPE_FIELD,
                [VarType::Change.as_str(), VarType::Addition.as_str()],
            ),
            Filter::is_in(VARIANT_FIELD, [variant]),
        ]),
    ]))
}

fn overlay_rank(document: &Document) -> u8 {
    match document.get(VAR_TYPE_FIELD).and_then(Value::as_str) {
        Some("change") | Some("addition") => 1,
        _ => 0,
    }
}

/// Keep one document per `index`, preferring change/addition over base.
/// The result is ordered by index; documents without an index are dropped.
pub fn dedupe_by_index(documents: Vec<Document>) -> Vec<Document> {
    let mut by_index: BTreeMap<i64, Document> = BTreeMap::new();
    for document in documents {
        let Some(index) = get_i64(&document, INDEX_FIELD) else {
            tracing::warn!("skipping element document without index");
            continue;
        };
        match by_index.get(&index) {
            Some(existing) if overlay_rank(existing) >= overlay_rank(&document) => {}
            _ => {
                by_index.insert(index, document);
            }
        }
    }
    by_index.into_values().collect()
}
