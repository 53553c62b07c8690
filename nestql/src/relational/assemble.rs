use super::layout::ColumnType;
use super::plan::{QueryPlan, Shape};
use super::sql::TOTAL;
use super::structure::Row;
use crate::projection::{Projection, ProjectionTree};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

/// Resources of one page plus the number of matching roots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub total: u64,
    pub items: Vec<Value>,
}

/// Rebuild nested resources from the flat rows of a search statement.
///
/// Rows are grouped by root id in first-seen order; synthetic rows are
/// grouped by their own id and ordered by it, which undoes the row
/// multiplication of sibling joins.
pub fn assemble(plan: &QueryPlan, rows: &[Row]) -> SearchResults {
    let total = rows
        .first()
        .and_then(|row| row.get(TOTAL))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let all: Vec<&Row> = rows.iter().collect();
    let items = match &plan.row_id {
        Some(root_id) => group_by(&all, root_id, false)
            .into_iter()
            .map(|(_, group)| build(plan, &plan.shape, &group))
            .collect(),
        None => Vec::new(),
    };
    SearchResults { total, items }
}

fn build(plan: &QueryPlan, shape: &Shape, rows: &[&Row]) -> Value {
    let Some(first) = rows.first() else {
        return Value::Null;
    };
    match shape {
        Shape::Absent => Value::Null,
        Shape::Column { alias, ty } => convert(*ty, first.get(alias).unwrap_or(&Value::Null)),
        Shape::Object { presence, fields } => {
            if let Some(presence) = presence {
                if !is_set(first.get(presence)) {
                    return Value::Null;
                }
            }
            let mut object = Map::new();
            for (name, field) in fields {
                object.insert(name.clone(), build(plan, field, rows));
            }
            Value::Object(object)
        }
        Shape::Lookup { path } => match plan.lookups.get(path) {
            Some(lookup) => build_lookup(lookup, rows),
            None => Value::Null,
        },
        Shape::Dynamic {
            presence,
            patterns,
            keys,
        } => {
            if !is_set(first.get(presence)) {
                return Value::Null;
            }
            let mut entries: Vec<(String, String, Value)> = Vec::new();
            for pattern in patterns {
                let Some(lookup) = plan.lookups.get(pattern) else {
                    continue;
                };
                let (Some(row_id), Some(key_alias)) = (&lookup.row_id, &lookup.key) else {
                    continue;
                };
                for (id, group) in group_by(rows, row_id, true) {
                    let Some(key) = group[0].get(key_alias).and_then(Value::as_str) else {
                        continue;
                    };
                    let value = build(lookup, &lookup.shape, &group);
                    entries.push((id, key.to_string(), value));
                }
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut object = Map::new();
            for (_, key, value) in entries {
                match keys.as_ref().map(|tree| tree.get(&key)) {
                    None | Some(Some(Projection::Whole)) => {
                        object.insert(key, value);
                    }
                    Some(Some(Projection::Nested(tree))) => {
                        object.insert(key, prune(value, tree));
                    }
                    Some(None) => {}
                }
            }
            Value::Object(object)
        }
    }
}

fn build_lookup(lookup: &QueryPlan, rows: &[&Row]) -> Value {
    let Some(row_id) = &lookup.row_id else {
        return Value::Null;
    };
    if lookup.to_many {
        let values = group_by(rows, row_id, true)
            .into_iter()
            .map(|(_, group)| build(lookup, &lookup.shape, &group))
            .collect();
        return Value::Array(values);
    }
    match rows.first().and_then(|row| row.get(row_id)) {
        None | Some(Value::Null) => Value::Null,
        Some(_) => build(lookup, &lookup.shape, rows),
    }
}

/// Group rows by the value of `alias`, skipping nulls. Groups keep
/// first-seen order unless `sorted` is set.
fn group_by<'r>(rows: &[&'r Row], alias: &str, sorted: bool) -> IndexMap<String, Vec<&'r Row>> {
    let mut groups: IndexMap<String, Vec<&'r Row>> = IndexMap::new();
    for &row in rows {
        let id = match row.get(alias) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => continue,
            Some(other) => other.to_string(),
        };
        groups.entry(id).or_default().push(row);
    }
    if sorted {
        groups.sort_keys();
    }
    groups
}

fn is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map_or(false, |n| n != 0),
        _ => false,
    }
}

/// Convert a stored column value back to its JSON form.
fn convert(ty: ColumnType, value: &Value) -> Value {
    match (ty, value) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().map_or(false, |n| n != 0)),
        (ColumnType::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        _ => value.clone(),
    }
}

/// Keep only the parts of a value selected by a projection tree.
pub fn prune(value: Value, tree: &ProjectionTree) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter_map(|(key, value)| match tree.get(&key) {
                    Some(Projection::Whole) => Some((key, value)),
                    Some(Projection::Nested(subtree)) => Some((key, prune(value, subtree))),
                    None => None,
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| prune(v, tree)).collect()),
        other => other,
    }
}
