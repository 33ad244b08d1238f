//! Opaque objects: values the store cannot interpret but must return intact.
//!
//! Encoded as `{"_module": .., "_class": .., "_object": ..}` where `_object`
//! is the producer's own serialization of the value. Decoding hands the
//! three parts back unchanged; reconstructing a live object is the caller's
//! business.

use crate::error::CodecError;
use gridhub_doc::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MODULE_FIELD: &str = "_module";
pub const CLASS_FIELD: &str = "_class";
pub const OBJECT_FIELD: &str = "_object";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueObject {
    #[serde(rename = "_module")]
    pub module: String,
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(rename = "_object")]
    pub payload: String,
}

impl OpaqueObject {
    pub fn new(
        module: impl Into<String>,
        class: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            class: class.into(),
            payload: payload.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut doc = Document::new();
        doc.insert(MODULE_FIELD.to_string(), Value::String(self.module.clone()));
        doc.insert(CLASS_FIELD.to_string(), Value::String(self.class.clone()));
        doc.insert(OBJECT_FIELD.to_string(), Value::String(self.payload.clone()));
        Value::Object(doc)
    }

    pub fn is_tagged(value: &Value) -> bool {
        value.as_object().is_some_and(|obj| {
            obj.contains_key(MODULE_FIELD)
                && obj.contains_key(CLASS_FIELD)
                && obj.contains_key(OBJECT_FIELD)
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::InvalidObject(format!("expected object, found {value}")))?;
        let field = |name: &str| -> Result<String, CodecError> {
            match obj.get(name) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Err(CodecError::InvalidObject(format!(
                    "`{name}` must be a string, found {other}"
                ))),
                None => Err(CodecError::InvalidObject(format!("missing `{name}`"))),
            }
        };
        Ok(Self {
            module: field(MODULE_FIELD)?,
            class: field(CLASS_FIELD)?,
            payload: field(OBJECT_FIELD)?,
        })
    }
}
