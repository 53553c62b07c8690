//! Naming and placement rules shared by every part of the relational
//! backend. Metadata, the structurer, the query planner and the assembler
//! all walk the schema through these functions, so table and column names
//! always agree.

use crate::schema::{ArrayField, DynamicObjectField, FieldSchema, ObjectField};
use serde::{Deserialize, Serialize};

pub const ROW_ID: &str = "_id";
pub const PARENT_ID: &str = "_parentId";
pub const RESOURCE_ID: &str = "_resourceId";
pub const KEY: &str = "key";
/// Column prefix of the value stored in a synthetic table row.
pub const VALUE: &str = "value";

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Timestamp,
    Blob,
    Id,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean | ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Id => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// Where a value of a given schema lives.
pub enum Placement<'a> {
    /// `null` fields store nothing.
    Absent,
    Column(ColumnType),
    /// Object stored in its parent row, with a presence column.
    Inline(&'a ObjectField),
    /// Object moved to its own single-row table.
    Extracted(&'a ObjectField),
    /// One synthetic row per element.
    Elements(&'a ArrayField),
    /// One synthetic table per pattern, one row per key; a presence column
    /// stays in the parent row.
    Dynamic(&'a DynamicObjectField),
}

/// Placement of a value nested `level` objects deep in its table. Objects
/// deeper than `inline_threshold` are extracted; the value at level 0 of a
/// synthetic table is always inline.
pub fn placement(schema: &FieldSchema, level: usize, inline_threshold: usize) -> Placement<'_> {
    match schema {
        FieldSchema::Null(_) => Placement::Absent,
        FieldSchema::Boolean(_) => Placement::Column(ColumnType::Boolean),
        FieldSchema::Integer(_) => Placement::Column(ColumnType::Integer),
        FieldSchema::Float(_) => Placement::Column(ColumnType::Float),
        FieldSchema::String(_) => Placement::Column(ColumnType::Text),
        FieldSchema::Date(_) => Placement::Column(ColumnType::Timestamp),
        FieldSchema::Binary(_) => Placement::Column(ColumnType::Blob),
        FieldSchema::Id(_) => Placement::Column(ColumnType::Id),
        FieldSchema::Object(object) if level > inline_threshold => Placement::Extracted(object),
        FieldSchema::Object(object) => Placement::Inline(object),
        FieldSchema::Array(array) => Placement::Elements(array),
        FieldSchema::DynamicObject(dynamic) => Placement::Dynamic(dynamic),
    }
}

pub fn column_name(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}_{field}")
    }
}

/// Table holding the elements (or the extracted object) stored at `column`.
pub fn sub_table(table: &str, column: &str) -> String {
    format!("{table}_{column}")
}

/// Table holding the keys of a dynamic object matching pattern `index`.
pub fn pattern_table(table: &str, column: &str, index: usize) -> String {
    format!("{table}_{column}_{index}")
}

/// Synthetic row id; ids of one write pass sort in creation order.
pub fn synthetic_id(resource_id: &str, counter: u64) -> String {
    format!("{resource_id}-{counter:08}")
}

pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Quote an SQL identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
