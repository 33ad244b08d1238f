//! Attribute types and cell values.

use crate::error::CodecError;
use crate::geometry::Geometry;
use crate::object::OpaqueObject;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Declared type of one table attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrType {
    #[serde(rename = "float64")]
    Float,
    #[serde(rename = "int64")]
    Int,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "category")]
    Category,
    #[serde(rename = "str")]
    Text,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "geometry")]
    Geometry,
}

impl AttrType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttrType::Float => "float64",
            AttrType::Int => "int64",
            AttrType::Bool => "bool",
            AttrType::Category => "category",
            AttrType::Text => "str",
            AttrType::Object => "object",
            AttrType::Geometry => "geometry",
        }
    }
}

impl Display for AttrType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttrType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float64" | "float" => Ok(AttrType::Float),
            "int64" | "int" | "uint32" | "int32" => Ok(AttrType::Int),
            "bool" => Ok(AttrType::Bool),
            "category" => Ok(AttrType::Category),
            "str" | "string" => Ok(AttrType::Text),
            "object" => Ok(AttrType::Object),
            "geometry" => Ok(AttrType::Geometry),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }
}

/// One cell of a table.
///
/// `Missing` is the explicit "no value" marker; it is distinct from `0`,
/// `""`, `false` and from `Float(NaN)`.
#[derive(Debug, Clone, Default)]
pub enum CellValue {
    #[default]
    Missing,
    Float(f64),
    Int(i64),
    Bool(bool),
    Category(String),
    Text(String),
    Object(OpaqueObject),
    Geometry(Geometry),
}

impl CellValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, CellValue::Missing)
    }

    /// The natural attribute type of a present value.
    pub fn attr_type(&self) -> Option<AttrType> {
        match self {
            CellValue::Missing => None,
            CellValue::Float(_) => Some(AttrType::Float),
            CellValue::Int(_) => Some(AttrType::Int),
            CellValue::Bool(_) => Some(AttrType::Bool),
            CellValue::Category(_) => Some(AttrType::Category),
            CellValue::Text(_) => Some(AttrType::Text),
            CellValue::Object(_) => Some(AttrType::Object),
            CellValue::Geometry(_) => Some(AttrType::Geometry),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(f) => Some(*f),
            CellValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Category(s) | CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellValue::Missing, CellValue::Missing) => true,
            // NaN is a stored value, and a round trip must reproduce it.
            (CellValue::Float(a), CellValue::Float(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (CellValue::Int(a), CellValue::Int(b)) => a == b,
            (CellValue::Bool(a), CellValue::Bool(b)) => a == b,
            (CellValue::Category(a), CellValue::Category(b)) => a == b,
            (CellValue::Text(a), CellValue::Text(b)) => a == b,
            (CellValue::Object(a), CellValue::Object(b)) => a == b,
            (CellValue::Geometry(a), CellValue::Geometry(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<Geometry> for CellValue {
    fn from(value: Geometry) -> Self {
        CellValue::Geometry(value)
    }
}

impl From<OpaqueObject> for CellValue {
    fn from(value: OpaqueObject) -> Self {
        CellValue::Object(value)
    }
}
