//! # gridhub-table
//!
//! Typed element tables and their mapping to documents.
//!
//! A [`Table`] holds the rows of one element kind keyed by integer index;
//! a [`TableSchema`] declares each attribute's type and default. The codec
//! turns rows into documents and back without losing missing values,
//! non-finite floats, opaque objects or geometry.

pub mod codec;
pub mod error;
pub mod geometry;
pub mod object;
pub mod schema;
pub mod table;
pub mod value;

pub use codec::{
    INDEX_FIELD, RESERVED_FIELDS, coerce, decode_cell, decode_document, documents_to_table,
    encode_cell, encode_row, infer_cell, is_reserved, rows_to_documents,
};
pub use error::CodecError;
pub use geometry::{Geometry, Position, is_geometry_column};
pub use object::OpaqueObject;
pub use schema::{AttributeDef, AttributeSpec, SchemaCatalog, TableSchema};
pub use table::{Row, Table, row};
pub use value::{AttrType, CellValue};
