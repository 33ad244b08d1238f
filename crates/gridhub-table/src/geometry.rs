//! GeoJSON geometry values.
//!
//! Geometry columns are named `geo` or end in `_geo`. Stored documents carry
//! the GeoJSON object itself so a document database can index it; older
//! datasets stored the GeoJSON as a string, which is still accepted on read.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Position = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    fn positions(&self) -> Vec<&Position> {
        match self {
            Geometry::Point(p) => vec![p],
            Geometry::MultiPoint(ps) | Geometry::LineString(ps) => ps.iter().collect(),
            Geometry::MultiLineString(lines) | Geometry::Polygon(lines) => {
                lines.iter().flatten().collect()
            }
            Geometry::MultiPolygon(polys) => polys.iter().flatten().flatten().collect(),
        }
    }

    /// Positions must have two or three finite ordinates.
    pub fn validate(&self) -> Result<(), CodecError> {
        for position in self.positions() {
            if !(2..=3).contains(&position.len()) {
                return Err(CodecError::InvalidGeometry(format!(
                    "{} position has {} ordinates",
                    self.type_name(),
                    position.len()
                )));
            }
            if position.iter().any(|c| !c.is_finite()) {
                return Err(CodecError::InvalidGeometry(format!(
                    "{} position has a non-finite ordinate",
                    self.type_name()
                )));
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a GeoJSON object, or a string holding one.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let geometry: Geometry = match value {
            Value::String(text) => serde_json::from_str(text)
                .map_err(|e| CodecError::InvalidGeometry(e.to_string()))?,
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| CodecError::InvalidGeometry(e.to_string()))?,
            other => {
                return Err(CodecError::InvalidGeometry(format!(
                    "expected GeoJSON object, found {other}"
                )));
            }
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Whether a JSON object looks like a GeoJSON geometry.
    pub fn is_geojson(value: &Value) -> bool {
        value.as_object().is_some_and(|obj| {
            obj.contains_key("coordinates")
                && obj.get("type").and_then(Value::as_str).is_some_and(|t| {
                    matches!(
                        t,
                        "Point"
                            | "MultiPoint"
                            | "LineString"
                            | "MultiLineString"
                            | "Polygon"
                            | "MultiPolygon"
                    )
                })
        })
    }
}

/// Whether a column holds geometry by naming convention.
pub fn is_geometry_column(name: &str) -> bool {
    name == "geo" || name.ends_with("_geo")
}
