use super::layout::{
    column_name, join_path, pattern_table, placement, sub_table, synthetic_id, ColumnType,
    Placement, KEY, PARENT_ID, RESOURCE_ID, ROW_ID, VALUE,
};
use super::metadata::ResourceMetadata;
use crate::error::{NestqlError, Result};
use crate::schema::{FieldSchema, Model, PRIMARY_KEY};
use crate::search::{format_date, parse_date};
use crate::validation::{type_name, validate_scalar};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

/// One row to write, column → value.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    /// Only keys present in the payload are written; nested values present
    /// in the payload replace the stored ones.
    Update,
}

/// Rows of one resource, per table, parents before children.
///
/// Every non-root table listed is replaced: its rows for this resource are
/// cleared before the listed rows (possibly none) are inserted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredPayload {
    pub resource: String,
    pub root_id: String,
    pub tables: IndexMap<String, Vec<Row>>,
}

impl StructuredPayload {
    pub fn root_row(&self) -> Option<&Row> {
        self.tables.get(&self.resource).and_then(|rows| rows.first())
    }
}

/// Flatten a nested payload into normalized rows.
pub fn structure(
    model: &Model,
    metadata: &ResourceMetadata,
    root_id: &str,
    payload: &Value,
    mode: Mode,
) -> Result<StructuredPayload> {
    let resource = metadata.resource.as_str();
    let schema = model.resource(resource)?;
    let object = payload.as_object().ok_or_else(|| {
        NestqlError::invalid(
            resource,
            format!("payload must be an object, got {}", type_name(payload)),
        )
    })?;
    if object.contains_key(PRIMARY_KEY) {
        return Err(NestqlError::invalid(
            PRIMARY_KEY,
            "the primary key is assigned by the store",
        ));
    }
    if let Some(key) = object.keys().find(|k| !schema.fields.contains_key(*k)) {
        return Err(NestqlError::unknown(key.as_str()));
    }

    let mut structurer = Structurer {
        root_id,
        inline_threshold: model.settings.inline_threshold,
        counter: 0,
        tables: IndexMap::new(),
    };
    structurer.table(resource);

    let mut row = Row::new();
    row.insert(ROW_ID.to_string(), Value::String(root_id.to_string()));
    for (name, field) in schema.fields.iter().filter(|(n, _)| *n != PRIMARY_KEY) {
        match (object.get(name), mode) {
            (None, Mode::Update) => continue,
            (None, Mode::Create) => {
                structurer.write(resource, &mut row, name, field, &Value::Null, 0, name)?
            }
            (Some(value), _) => structurer.write(resource, &mut row, name, field, value, 0, name)?,
        }
    }
    structurer
        .tables
        .entry(resource.to_string())
        .or_default()
        .push(row);

    let mut tables = structurer.tables;
    if mode == Mode::Update {
        let replaced: Vec<String> = tables.keys().skip(1).cloned().collect();
        for table in replaced {
            for descendant in metadata.descendants(&table) {
                tables.entry(descendant.to_string()).or_default();
            }
        }
    }

    Ok(StructuredPayload {
        resource: resource.to_string(),
        root_id: root_id.to_string(),
        tables,
    })
}

struct Structurer<'a> {
    root_id: &'a str,
    inline_threshold: usize,
    counter: u64,
    tables: IndexMap<String, Vec<Row>>,
}

impl<'a> Structurer<'a> {
    fn table(&mut self, name: &str) {
        self.tables.entry(name.to_string()).or_default();
    }

    /// Start a synthetic row linked to `parent`.
    fn child_row(&mut self, parent: &Row) -> Row {
        self.counter += 1;
        let parent_id = parent
            .get(ROW_ID)
            .and_then(Value::as_str)
            .unwrap_or(self.root_id);
        let mut row = Row::new();
        row.insert(ROW_ID.into(), synthetic_id(self.root_id, self.counter).into());
        row.insert(PARENT_ID.into(), parent_id.into());
        row.insert(RESOURCE_ID.into(), self.root_id.into());
        row
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        table: &str,
        row: &mut Row,
        column: &str,
        schema: &FieldSchema,
        value: &Value,
        level: usize,
        path: &str,
    ) -> Result<()> {
        if value.is_null() {
            if schema.is_required() {
                return Err(NestqlError::MissingField {
                    path: path.to_string(),
                });
            }
            self.blank(table, row, column, schema, level);
            return Ok(());
        }

        match placement(schema, level, self.inline_threshold) {
            Placement::Absent => validate_scalar(path, schema, value)?,
            Placement::Column(ty) => {
                validate_scalar(path, schema, value)?;
                row.insert(column.to_string(), normalize(ty, value));
            }
            Placement::Inline(object) => {
                let map = expect_object(path, value)?;
                if let Some(key) = map.keys().find(|k| !object.fields.contains_key(*k)) {
                    return Err(NestqlError::unknown(join_path(path, key)));
                }
                row.insert(column.to_string(), Value::Bool(true));
                for (name, field) in &object.fields {
                    self.write(
                        table,
                        row,
                        &column_name(column, name),
                        field,
                        map.get(name).unwrap_or(&Value::Null),
                        level + 1,
                        &join_path(path, name),
                    )?;
                }
            }
            Placement::Extracted(_) => {
                let sub = sub_table(table, column);
                self.table(&sub);
                let mut child = self.child_row(row);
                self.write(&sub, &mut child, VALUE, schema, value, 0, path)?;
                self.push(&sub, child);
            }
            Placement::Elements(array) => {
                let sub = sub_table(table, column);
                self.table(&sub);
                let items = value.as_array().ok_or_else(|| {
                    NestqlError::invalid(path, format!("expected array, got {}", type_name(value)))
                })?;
                for (index, item) in items.iter().enumerate() {
                    let mut child = self.child_row(row);
                    self.write(&sub, &mut child, VALUE, &array.fields, item, 0, &format!("{path}.{index}"))?;
                    self.push(&sub, child);
                }
            }
            Placement::Dynamic(dynamic) => {
                let map = expect_object(path, value)?;
                row.insert(column.to_string(), Value::Bool(true));
                for index in 0..dynamic.fields.len() {
                    self.table(&pattern_table(table, column, index));
                }
                for (key, item) in map {
                    let key_path = join_path(path, key);
                    let (index, field) = dynamic
                        .matching(key)
                        .ok_or_else(|| NestqlError::unknown(key_path.as_str()))?;
                    let sub = pattern_table(table, column, index);
                    let mut child = self.child_row(row);
                    child.insert(KEY.into(), Value::String(key.clone()));
                    self.write(&sub, &mut child, VALUE, field, item, 0, &key_path)?;
                    self.push(&sub, child);
                }
            }
        }
        Ok(())
    }

    /// Columns of an absent value: nulls, false presence markers, and empty
    /// synthetic tables.
    fn blank(&mut self, table: &str, row: &mut Row, column: &str, schema: &FieldSchema, level: usize) {
        match placement(schema, level, self.inline_threshold) {
            Placement::Absent => {}
            Placement::Column(_) => {
                row.insert(column.to_string(), Value::Null);
            }
            Placement::Inline(object) => {
                row.insert(column.to_string(), Value::Bool(false));
                for (name, field) in &object.fields {
                    self.blank(table, row, &column_name(column, name), field, level + 1);
                }
            }
            Placement::Extracted(_) | Placement::Elements(_) => {
                self.table(&sub_table(table, column));
            }
            Placement::Dynamic(dynamic) => {
                row.insert(column.to_string(), Value::Bool(false));
                for index in 0..dynamic.fields.len() {
                    self.table(&pattern_table(table, column, index));
                }
            }
        }
    }

    fn push(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }
}

fn expect_object<'v>(path: &str, value: &'v Value) -> Result<&'v Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        NestqlError::invalid(path, format!("expected object, got {}", type_name(value)))
    })
}

fn normalize(ty: ColumnType, value: &Value) -> Value {
    match (ty, value) {
        (ColumnType::Timestamp, Value::String(s)) => match parse_date(s) {
            Some(date) => Value::String(format_date(&date)),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}
