//! Element-kind schemas and default templates.

use crate::geometry::is_geometry_column;
use crate::table::{Row, Table};
use crate::value::{AttrType, CellValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub ty: AttrType,
    /// Value used when a row does not set this attribute.
    pub default: CellValue,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, ty: AttrType, default: impl Into<CellValue>) -> Self {
        Self {
            name: name.into(),
            ty,
            default: default.into(),
        }
    }

    pub fn missing(name: impl Into<String>, ty: AttrType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: CellValue::Missing,
        }
    }
}

/// Serialized `(name, type)` pair recorded alongside stored networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttrType,
}

/// Ordered attribute set of one element kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    pub kind: String,
    pub attributes: Vec<AttributeDef>,
}

impl TableSchema {
    pub fn new(kind: impl Into<String>, attributes: Vec<AttributeDef>) -> Self {
        Self {
            kind: kind.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_type(&self, name: &str) -> Option<AttrType> {
        self.attribute(name).map(|a| a.ty)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    /// A row holding every default.
    pub fn default_row(&self) -> Row {
        self.attributes
            .iter()
            .map(|a| (a.name.clone(), a.default.clone()))
            .collect()
    }

    /// Fill attributes the partial row leaves unset from the defaults.
    pub fn complete_row(&self, partial: &Row) -> Row {
        let mut row = self.default_row();
        for (name, value) in partial {
            row.insert(name.clone(), value.clone());
        }
        row
    }

    pub fn specs(&self) -> Vec<AttributeSpec> {
        self.attributes
            .iter()
            .map(|a| AttributeSpec {
                name: a.name.clone(),
                ty: a.ty,
            })
            .collect()
    }

    /// Derive a schema from a table's columns and present values.
    ///
    /// A column's type comes from its first present value; geometry columns
    /// are recognized by name; all-missing columns default to `float64`.
    pub fn infer(table: &Table) -> Self {
        let attributes = table
            .columns()
            .iter()
            .map(|name| {
                let ty = if is_geometry_column(name) {
                    AttrType::Geometry
                } else {
                    table
                        .column(name)
                        .into_iter()
                        .find_map(CellValue::attr_type)
                        .unwrap_or(AttrType::Float)
                };
                AttributeDef::missing(name.clone(), ty)
            })
            .collect();
        Self::new(table.kind.clone(), attributes)
    }

    /// Rebuild a schema from recorded specs, taking defaults from `base`
    /// where the attribute is known there with the same type.
    pub fn from_specs(
        kind: impl Into<String>,
        specs: &[AttributeSpec],
        base: Option<&TableSchema>,
    ) -> Self {
        let attributes = specs
            .iter()
            .map(|spec| {
                let default = base
                    .and_then(|b| b.attribute(&spec.name))
                    .filter(|a| a.ty == spec.ty)
                    .map(|a| a.default.clone())
                    .unwrap_or_default();
                AttributeDef {
                    name: spec.name.clone(),
                    ty: spec.ty,
                    default,
                }
            })
            .collect();
        Self::new(kind, attributes)
    }

    /// Add attributes of `other` this schema lacks, keeping existing order.
    pub fn extend_from(&mut self, other: &TableSchema) {
        for attr in &other.attributes {
            if self.attribute(&attr.name).is_none() {
                self.attributes.push(attr.clone());
            }
        }
    }
}

/// Known element kinds and their default templates.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: TableSchema) {
        self.schemas.insert(schema.kind.clone(), schema);
    }

    pub fn get(&self, kind: &str) -> Option<&TableSchema> {
        self.schemas.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Schema for writing `table`: the catalog entry extended with any extra
    /// columns of the table, or a fully inferred schema for unknown kinds.
    pub fn schema_for(&self, table: &Table) -> TableSchema {
        let inferred = TableSchema::infer(table);
        match self.get(&table.kind) {
            Some(known) => {
                let mut schema = known.clone();
                schema.extend_from(&inferred);
                schema
            }
            None => inferred,
        }
    }

    /// Schema for reading a kind without a recorded layout.
    pub fn schema_or_empty(&self, kind: &str) -> TableSchema {
        self.get(kind)
            .cloned()
            .unwrap_or_else(|| TableSchema::new(kind, Vec::new()))
    }

    /// Default templates for the common power-grid element kinds.
    pub fn power_grid() -> Self {
        use AttrType::{Bool, Category, Float, Geometry, Int, Text};

        let name = || AttributeDef::missing("name", Text);
        let in_service = || AttributeDef::new("in_service", Bool, true);
        let bus_ref = |n: &str| AttributeDef::missing(n, Int);
        let zero = |n: &str| AttributeDef::new(n, Float, 0.0);
        let one = |n: &str| AttributeDef::new(n, Float, 1.0);
        let unset = |n: &str| AttributeDef::missing(n, Float);

        let mut catalog = Self::new();
        catalog.insert(TableSchema::new(
            "bus",
            vec![
                name(),
                unset("vn_kv"),
                AttributeDef::new("type", Category, CellValue::Category("b".to_string())),
                AttributeDef::missing("zone", Category),
                in_service(),
                AttributeDef::missing("geo", Geometry),
            ],
        ));
        catalog.insert(TableSchema::new(
            "line",
            vec![
                name(),
                AttributeDef::missing("std_type", Text),
                bus_ref("from_bus"),
                bus_ref("to_bus"),
                one("length_km"),
                unset("r_ohm_per_km"),
                unset("x_ohm_per_km"),
                unset("c_nf_per_km"),
                zero("g_us_per_km"),
                unset("max_i_ka"),
                one("df"),
                AttributeDef::new("parallel", Int, 1_i64),
                AttributeDef::new("type", Category, CellValue::Category("ol".to_string())),
                in_service(),
                AttributeDef::missing("geo", Geometry),
            ],
        ));
        catalog.insert(TableSchema::new(
            "load",
            vec![
                name(),
                bus_ref("bus"),
                zero("p_mw"),
                zero("q_mvar"),
                zero("const_z_percent"),
                zero("const_i_percent"),
                unset("sn_mva"),
                one("scaling"),
                in_service(),
                AttributeDef::new("type", Category, CellValue::Category("wye".to_string())),
            ],
        ));
        catalog.insert(TableSchema::new(
            "sgen",
            vec![
                name(),
                bus_ref("bus"),
                zero("p_mw"),
                zero("q_mvar"),
                unset("sn_mva"),
                one("scaling"),
                in_service(),
                AttributeDef::new("type", Category, CellValue::Category("wye".to_string())),
                AttributeDef::new("current_source", Bool, true),
            ],
        ));
        catalog.insert(TableSchema::new(
            "gen",
            vec![
                name(),
                bus_ref("bus"),
                zero("p_mw"),
                one("vm_pu"),
                unset("sn_mva"),
                unset("min_q_mvar"),
                unset("max_q_mvar"),
                one("scaling"),
                AttributeDef::new("slack", Bool, false),
                in_service(),
                AttributeDef::missing("type", Category),
            ],
        ));
        catalog.insert(TableSchema::new(
            "ext_grid",
            vec![
                name(),
                bus_ref("bus"),
                one("vm_pu"),
                zero("va_degree"),
                one("slack_weight"),
                in_service(),
            ],
        ));
        catalog.insert(TableSchema::new(
            "switch",
            vec![
                bus_ref("bus"),
                bus_ref("element"),
                AttributeDef::new("et", Category, CellValue::Category("b".to_string())),
                AttributeDef::missing("type", Category),
                AttributeDef::new("closed", Bool, true),
                name(),
                zero("z_ohm"),
            ],
        ));
        catalog.insert(TableSchema::new(
            "trafo",
            vec![
                name(),
                AttributeDef::missing("std_type", Text),
                bus_ref("hv_bus"),
                bus_ref("lv_bus"),
                unset("sn_mva"),
                unset("vn_hv_kv"),
                unset("vn_lv_kv"),
                unset("vk_percent"),
                unset("vkr_percent"),
                zero("pfe_kw"),
                zero("i0_percent"),
                zero("shift_degree"),
                AttributeDef::new("tap_pos", Int, 0_i64),
                AttributeDef::new("parallel", Int, 1_i64),
                one("df"),
                in_service(),
            ],
        ));
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::row;

    #[test]
    fn complete_row_fills_unset_attributes_from_template() {
        let catalog = SchemaCatalog::power_grid();
        let bus = catalog.get("bus").expect("bus schema");
        let filled = bus.complete_row(&row([("name", "X")]));
        assert_eq!(filled["name"], CellValue::Text("X".to_string()));
        assert_eq!(filled["in_service"], CellValue::Bool(true));
        assert_eq!(filled["type"], CellValue::Category("b".to_string()));
        assert_eq!(filled["vn_kv"], CellValue::Missing);
    }

    #[test]
    fn schema_for_unknown_kind_is_inferred() {
        let mut table = Table::new("storage");
        table.insert_row(
            0,
            row([
                ("max_e_mwh", CellValue::from(4.0)),
                ("bus", CellValue::from(2_i64)),
                ("name", CellValue::Missing),
            ]),
        );
        let schema = SchemaCatalog::power_grid().schema_for(&table);
        assert_eq!(schema.attribute_type("max_e_mwh"), Some(AttrType::Float));
        assert_eq!(schema.attribute_type("bus"), Some(AttrType::Int));
        assert_eq!(schema.attribute_type("name"), Some(AttrType::Float));
    }

    #[test]
    fn schema_for_known_kind_keeps_template_and_adds_extra_columns() {
        let mut table = Table::new("bus");
        table.insert_row(0, row([("vn_kv", CellValue::from(20.0)), ("substation", "s1".into())]));
        let schema = SchemaCatalog::power_grid().schema_for(&table);
        let names: Vec<&str> = schema.names().collect();
        assert_eq!(names.first(), Some(&"name"));
        assert_eq!(names.last(), Some(&"substation"));
        assert_eq!(schema.attribute_type("geo"), Some(AttrType::Geometry));
    }

    #[test]
    fn from_specs_reuses_matching_defaults() {
        let catalog = SchemaCatalog::power_grid();
        let specs = vec![
            AttributeSpec { name: "in_service".to_string(), ty: AttrType::Bool },
            AttributeSpec { name: "type".to_string(), ty: AttrType::Text },
        ];
        let schema = TableSchema::from_specs("bus", &specs, catalog.get("bus"));
        assert_eq!(schema.attributes[0].default, CellValue::Bool(true));
        assert_eq!(schema.attributes[1].default, CellValue::Missing);
    }
}
