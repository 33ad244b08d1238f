//! Codec errors.

use crate::value::AttrType;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("attribute `{attribute}`: expected {expected}, found {found}")]
    TypeMismatch {
        attribute: String,
        expected: AttrType,
        found: String,
    },

    #[error("attribute `{attribute}`: unsupported value: {detail}")]
    UnsupportedValue { attribute: String, detail: String },

    #[error("document {position} has no integer `index` field")]
    MissingIndex { position: usize },

    #[error("duplicate row index {0}")]
    DuplicateIndex(i64),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid opaque object: {0}")]
    InvalidObject(String),

    #[error("unknown attribute type: {0}")]
    UnknownType(String),
}
