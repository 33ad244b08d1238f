//! Table <-> document codec.
//!
//! One document per row. The row's index is stored in the `index` field and
//! every attribute is stored under its own name:
//!
//! | cell | document value |
//! |------|----------------|
//! | `Missing` | `null` |
//! | finite `Float` | JSON number |
//! | NaN / infinite `Float` | `{"_float": "nan" \| "inf" \| "-inf"}` |
//! | `Int`, `Bool` | JSON number / boolean |
//! | `Category`, `Text` | JSON string (the schema tells them apart) |
//! | `Object` | `{"_module", "_class", "_object"}` |
//! | `Geometry` | GeoJSON object |
//!
//! Overlay bookkeeping fields (`_id`, `net_id`, `var_type`, `variant`,
//! `not_in_var`) are owned by the store and never surface as attributes.

use crate::error::CodecError;
use crate::geometry::{Geometry, is_geometry_column};
use crate::object::OpaqueObject;
use crate::schema::TableSchema;
use crate::table::{Row, Table};
use crate::value::{AttrType, CellValue};
use gridhub_doc::{Document, get_i64};
use serde_json::{Number, Value};

pub const INDEX_FIELD: &str = "index";
const FLOAT_TAG: &str = "_float";

/// Fields that belong to the storage layer rather than to the row.
pub const RESERVED_FIELDS: [&str; 6] = [
    "_id",
    INDEX_FIELD,
    "net_id",
    "var_type",
    "variant",
    "not_in_var",
];

pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

pub fn encode_cell(value: &CellValue) -> Value {
    match value {
        CellValue::Missing => Value::Null,
        CellValue::Float(f) => match Number::from_f64(*f) {
            Some(n) => Value::Number(n),
            None => {
                let tag = if f.is_nan() {
                    "nan"
                } else if f.is_sign_positive() {
                    "inf"
                } else {
                    "-inf"
                };
                let mut doc = Document::new();
                doc.insert(FLOAT_TAG.to_string(), Value::String(tag.to_string()));
                Value::Object(doc)
            }
        },
        CellValue::Int(i) => Value::from(*i),
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Category(s) | CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Object(obj) => obj.to_value(),
        CellValue::Geometry(geometry) => geometry.to_value(),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer".to_string(),
        Value::Number(_) => "float".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn tagged_float(value: &Value) -> Option<f64> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    match obj.get(FLOAT_TAG)?.as_str()? {
        "nan" => Some(f64::NAN),
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Decode one stored value as the declared attribute type.
pub fn decode_cell(attribute: &str, value: &Value, ty: AttrType) -> Result<CellValue, CodecError> {
    let mismatch = || CodecError::TypeMismatch {
        attribute: attribute.to_string(),
        expected: ty,
        found: describe(value),
    };
    if value.is_null() {
        return Ok(CellValue::Missing);
    }
    match ty {
        AttrType::Float => match value {
            Value::Number(n) => n.as_f64().map(CellValue::Float).ok_or_else(mismatch),
            other => tagged_float(other).map(CellValue::Float).ok_or_else(mismatch),
        },
        AttrType::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(integral))
                .map(CellValue::Int)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        AttrType::Bool => value.as_bool().map(CellValue::Bool).ok_or_else(mismatch),
        AttrType::Category => value
            .as_str()
            .map(|s| CellValue::Category(s.to_string()))
            .ok_or_else(mismatch),
        AttrType::Text => value
            .as_str()
            .map(|s| CellValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        AttrType::Object => OpaqueObject::from_value(value).map(CellValue::Object),
        AttrType::Geometry => Geometry::from_value(value).map(CellValue::Geometry),
    }
}

/// Decode a value of an attribute the schema does not declare.
pub fn infer_cell(attribute: &str, value: &Value) -> Result<CellValue, CodecError> {
    match value {
        Value::Null => Ok(CellValue::Missing),
        Value::Bool(b) => Ok(CellValue::Bool(*b)),
        Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => CellValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        }),
        Value::String(s) => {
            if is_geometry_column(attribute)
                && let Ok(geometry) = Geometry::from_value(value)
            {
                return Ok(CellValue::Geometry(geometry));
            }
            Ok(CellValue::Text(s.clone()))
        }
        Value::Object(_) => {
            if let Some(f) = tagged_float(value) {
                Ok(CellValue::Float(f))
            } else if OpaqueObject::is_tagged(value) {
                OpaqueObject::from_value(value).map(CellValue::Object)
            } else if Geometry::is_geojson(value) {
                Geometry::from_value(value).map(CellValue::Geometry)
            } else {
                Err(CodecError::UnsupportedValue {
                    attribute: attribute.to_string(),
                    detail: "untagged object".to_string(),
                })
            }
        }
        Value::Array(_) => Err(CodecError::UnsupportedValue {
            attribute: attribute.to_string(),
            detail: "untagged array".to_string(),
        }),
    }
}

/// Cast a cell to the declared attribute type.
///
/// Integers widen to floats, integral floats narrow to integers, and
/// category/text convert freely; anything else is a type mismatch.
pub fn coerce(attribute: &str, cell: CellValue, ty: AttrType) -> Result<CellValue, CodecError> {
    let found = cell.attr_type();
    let coerced = match (cell, ty) {
        (CellValue::Missing, _) => Some(CellValue::Missing),
        (CellValue::Int(i), AttrType::Float) => Some(CellValue::Float(i as f64)),
        (CellValue::Float(f), AttrType::Int) => integral(f).map(CellValue::Int),
        (CellValue::Text(s) | CellValue::Category(s), AttrType::Category) => {
            Some(CellValue::Category(s))
        }
        (CellValue::Text(s) | CellValue::Category(s), AttrType::Text) => Some(CellValue::Text(s)),
        (cell, ty) if cell.attr_type() == Some(ty) => Some(cell),
        _ => None,
    };
    coerced.ok_or_else(|| CodecError::TypeMismatch {
        attribute: attribute.to_string(),
        expected: ty,
        found: found.map(AttrType::as_str).unwrap_or("missing").to_string(),
    })
}

/// Encode a row's attributes, casting declared ones to their schema type.
pub fn encode_row(row: &Row, schema: &TableSchema) -> Result<Document, CodecError> {
    let mut doc = Document::new();
    for (name, cell) in row {
        if is_reserved(name) {
            return Err(CodecError::UnsupportedValue {
                attribute: name.clone(),
                detail: "reserved field name".to_string(),
            });
        }
        let cell = match schema.attribute_type(name) {
            Some(ty) => coerce(name, cell.clone(), ty)?,
            None => cell.clone(),
        };
        if let CellValue::Geometry(geometry) = &cell {
            geometry.validate()?;
        }
        doc.insert(name.clone(), encode_cell(&cell));
    }
    Ok(doc)
}

/// Encode every row of `table` as one document.
///
/// Schema attributes the table has no column for are filled from the
/// schema's default template; columns the schema does not declare are
/// stored as they are.
pub fn rows_to_documents(table: &Table, schema: &TableSchema) -> Result<Vec<Document>, CodecError> {
    let unset: Vec<_> = schema
        .attributes
        .iter()
        .filter(|a| !table.has_column(&a.name))
        .collect();

    table
        .rows()
        .map(|(index, row)| {
            let mut full = row.clone();
            for attr in &unset {
                full.insert(attr.name.clone(), attr.default.clone());
            }
            let mut doc = encode_row(&full, schema)?;
            doc.insert(INDEX_FIELD.to_string(), Value::from(index));
            Ok(doc)
        })
        .collect()
}

/// Decode one document into `(index, row)`.
///
/// Declared attributes absent from the document take their default, so
/// documents written before an attribute existed read back complete.
pub fn decode_document(
    document: &Document,
    schema: &TableSchema,
    position: usize,
) -> Result<(i64, Row), CodecError> {
    let index = get_i64(document, INDEX_FIELD).ok_or(CodecError::MissingIndex { position })?;
    let mut row = Row::new();
    for attr in &schema.attributes {
        let cell = match document.get(&attr.name) {
            Some(value) => decode_cell(&attr.name, value, attr.ty)?,
            None => attr.default.clone(),
        };
        row.insert(attr.name.clone(), cell);
    }
    for (name, value) in document {
        if is_reserved(name) || schema.attribute(name).is_some() {
            continue;
        }
        row.insert(name.clone(), infer_cell(name, value)?);
    }
    Ok((index, row))
}

/// Decode documents into a table of `schema.kind`.
///
/// Columns are the schema's attributes in order, followed by undeclared
/// fields in order of first appearance.
pub fn documents_to_table(
    documents: &[Document],
    schema: &TableSchema,
) -> Result<Table, CodecError> {
    let mut table = Table::with_columns(schema.kind.clone(), schema.names());
    for (position, document) in documents.iter().enumerate() {
        let (index, row) = decode_document(document, schema, position)?;
        if table.row(index).is_some() {
            return Err(CodecError::DuplicateIndex(index));
        }
        table.insert_row(index, row);
    }
    Ok(table)
}
