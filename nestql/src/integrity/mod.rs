use crate::backend::SqliteBackend;
use crate::error::{NestqlError, Result};
use crate::relational::layout::{quote, RESOURCE_ID, ROW_ID};
use crate::relational::{Catalog, SqlValue};
use crate::schema::{FieldSchema, Model, CREATED_AT, CREATED_BY, IS_DELETED, UPDATED_AT, UPDATED_BY};
use crate::search::format_date;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Creation timestamps before this are treated as corrupt.
const EARLIEST_TIMESTAMP: &str = "2000-01-01T00:00:00.000Z";

/// Ids a payload references in one target resource.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRelation {
    pub resource: String,
    pub ids: BTreeSet<String>,
    /// Soft-deleted targets do not count as existing.
    pub live_only: bool,
}

/// Ids of one resource that failed an integrity audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub resource: String,
    pub failed_ids: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

/// Batched relation checks and data audits over the relational store.
pub struct IntegrityChecker<'a> {
    model: &'a Model,
    catalog: &'a Catalog,
    backend: &'a SqliteBackend,
}

impl<'a> IntegrityChecker<'a> {
    pub fn new(model: &'a Model, catalog: &'a Catalog, backend: &'a SqliteBackend) -> Self {
        IntegrityChecker {
            model,
            catalog,
            backend,
        }
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Relation ids referenced anywhere in a payload, grouped by target.
    pub fn collect_foreign_ids(&self, resource: &str, payload: &Value) -> Result<Vec<PendingRelation>> {
        let schema = self.model.resource(resource)?;
        let mut found: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        if let Value::Object(map) = payload {
            for (name, value) in map {
                if let Some(field) = schema.fields.get(name) {
                    gather(field, value, &mut found);
                }
            }
        }
        found
            .into_iter()
            .map(|(target, ids)| {
                Ok(PendingRelation {
                    live_only: self.model.resource(&target)?.soft_deletes(),
                    resource: target,
                    ids,
                })
            })
            .collect()
    }

    /// Verify every pending id exists, in a single query.
    pub fn check_foreign_ids(&self, pending: &[PendingRelation]) -> Result<()> {
        let mut selects = Vec::new();
        let mut params = Vec::new();
        for relation in pending.iter().filter(|r| !r.ids.is_empty()) {
            let placeholders = vec!["?"; relation.ids.len()].join(", ");
            let mut select = format!(
                "SELECT ? AS \"resource\", {id} AS \"id\" FROM {table} WHERE {id} IN ({placeholders})",
                id = quote(ROW_ID),
                table = quote(&relation.resource),
            );
            if relation.live_only {
                select.push_str(&format!(" AND {} = 0", quote(IS_DELETED)));
            }
            selects.push(select);
            params.push(SqlValue::Text(relation.resource.clone()));
            params.extend(relation.ids.iter().cloned().map(SqlValue::Text));
        }
        if selects.is_empty() {
            return Ok(());
        }

        let rows = self.backend.query_rows(&selects.join("\nUNION ALL\n"), &params)?;
        let existing: BTreeSet<(String, String)> = rows
            .iter()
            .filter_map(|row| Some((text(row.get("resource"))?, text(row.get("id"))?)))
            .collect();

        for relation in pending {
            for id in &relation.ids {
                if !existing.contains(&(relation.resource.clone(), id.clone())) {
                    return Err(NestqlError::NoResource {
                        collection: relation.resource.clone(),
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fail when any live row of any table still points at `id`.
    pub fn check_references_to(&self, resource: &str, id: &str) -> Result<()> {
        let metadata = self.catalog.resource(resource)?;
        let mut selects = Vec::new();
        let mut params = Vec::new();

        for (table, columns) in &metadata.inverted_relations {
            let owner = self.catalog.owner(table).unwrap_or(table.as_str());
            let soft = self.model.resource(owner)?.soft_deletes();
            for column in columns {
                let mut select = if table == owner {
                    format!(
                        "SELECT ? AS \"table\", COUNT(*) AS \"count\" FROM {} AS \"child\" WHERE \"child\".{} = ?",
                        quote(table),
                        quote(column)
                    )
                } else {
                    format!(
                        "SELECT ? AS \"table\", COUNT(*) AS \"count\" FROM {} AS \"child\" \
                         JOIN {} AS \"owner\" ON \"owner\".{} = \"child\".{} WHERE \"child\".{} = ?",
                        quote(table),
                        quote(owner),
                        quote(ROW_ID),
                        quote(RESOURCE_ID),
                        quote(column)
                    )
                };
                if soft {
                    let alias = if table == owner { "child" } else { "owner" };
                    select.push_str(&format!(" AND \"{alias}\".{} = 0", quote(IS_DELETED)));
                }
                selects.push(select);
                params.push(SqlValue::Text(table.clone()));
                params.push(SqlValue::Text(id.to_string()));
            }
        }
        if selects.is_empty() {
            return Ok(());
        }

        let rows = self.backend.query_rows(&selects.join("\nUNION ALL\n"), &params)?;
        for row in rows {
            let count = row.get("count").and_then(Value::as_i64).unwrap_or(0);
            if count > 0 {
                let table = text(row.get("table")).unwrap_or_default();
                return Err(NestqlError::ResourceReferenced {
                    collection: self.catalog.owner(&table).unwrap_or(&table).to_string(),
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    // ── Audits ───────────────────────────────────────────────────

    /// Audit automatic fields and relations of every row of a resource.
    pub fn check_integrity(&self, resource: &str) -> Result<IntegrityReport> {
        let schema = self.model.resource(resource)?;
        let metadata = self.catalog.resource(resource)?;
        let root = quote(resource);
        let mut selects = Vec::new();
        let mut params = Vec::new();

        if schema.enable_timestamps {
            let latest = format_date(&(Utc::now() + Duration::days(1)));
            selects.push(format!(
                "SELECT {id} AS \"id\" FROM {root} WHERE {c} IS NULL OR {c} < ? OR {c} > ? \
                 OR ({u} IS NOT NULL AND {u} <= {c})",
                id = quote(ROW_ID),
                c = quote(CREATED_AT),
                u = quote(UPDATED_AT),
            ));
            params.push(SqlValue::Text(EARLIEST_TIMESTAMP.to_string()));
            params.push(SqlValue::Text(latest));

            if schema.enable_authors {
                selects.push(format!(
                    "SELECT {id} AS \"id\" FROM {root} WHERE ({cb} IS NULL) <> ({c} IS NULL) \
                     OR ({ub} IS NULL) <> ({u} IS NULL)",
                    id = quote(ROW_ID),
                    c = quote(CREATED_AT),
                    u = quote(UPDATED_AT),
                    cb = quote(CREATED_BY),
                    ub = quote(UPDATED_BY),
                ));
            }
        }

        for structure in metadata.structures.values() {
            let is_root = structure.is_root();
            for constraint in structure.constraints.iter().filter(|c| !c.cascade) {
                let target = self.model.resource(&constraint.references_table)?;
                let (owner_id, created) = if is_root {
                    (format!("\"t\".{}", quote(ROW_ID)), format!("\"t\".{}", quote(CREATED_AT)))
                } else {
                    (format!("\"t\".{}", quote(RESOURCE_ID)), format!("\"o\".{}", quote(CREATED_AT)))
                };
                let mut select = format!("SELECT {owner_id} AS \"id\" FROM {} AS \"t\"", quote(&structure.name));
                if !is_root {
                    select.push_str(&format!(
                        " JOIN {root} AS \"o\" ON \"o\".{} = \"t\".{}",
                        quote(ROW_ID),
                        quote(RESOURCE_ID)
                    ));
                }
                select.push_str(&format!(
                    " LEFT JOIN {} AS \"r\" ON \"r\".{id} = \"t\".{col} WHERE \"t\".{col} IS NOT NULL AND (\"r\".{id} IS NULL",
                    quote(&constraint.references_table),
                    id = quote(ROW_ID),
                    col = quote(&constraint.column),
                ));
                if target.soft_deletes() && target.enable_timestamps && schema.enable_timestamps {
                    select.push_str(&format!(
                        " OR (\"r\".{} = 1 AND \"r\".{} < {created})",
                        quote(IS_DELETED),
                        quote(UPDATED_AT)
                    ));
                }
                select.push(')');
                selects.push(select);
            }
        }

        if selects.is_empty() {
            return Ok(IntegrityReport {
                resource: resource.to_string(),
                failed_ids: Vec::new(),
            });
        }
        let sql = format!(
            "SELECT DISTINCT \"id\" FROM (\n{}\n) ORDER BY \"id\"",
            selects.join("\nUNION ALL\n")
        );
        let rows = self.backend.query_rows(&sql, &params)?;
        Ok(IntegrityReport {
            resource: resource.to_string(),
            failed_ids: rows.iter().filter_map(|row| text(row.get("id"))).collect(),
        })
    }

    /// Audit every resource; fails only after all of them were scanned.
    pub fn check_all_integrity(&self) -> Result<Vec<IntegrityReport>> {
        let mut reports = Vec::new();
        let mut failed = Vec::new();
        for resource in self.model.resource_names() {
            let report = self.check_integrity(resource)?;
            if !report.is_ok() {
                log::warn!(
                    "Integrity check failed for {} ({} rows): {}",
                    resource,
                    report.failed_ids.len(),
                    report.failed_ids.join(", ")
                );
                failed.push(resource.to_string());
            }
            reports.push(report);
        }
        if !failed.is_empty() {
            return Err(NestqlError::FailedIntegrityChecks { resources: failed });
        }
        Ok(reports)
    }
}

fn gather(schema: &FieldSchema, value: &Value, found: &mut BTreeMap<String, BTreeSet<String>>) {
    match (schema, value) {
        (FieldSchema::Id(id), Value::String(s)) => {
            if let Some(target) = &id.relation {
                found.entry(target.clone()).or_default().insert(s.clone());
            }
        }
        (FieldSchema::Array(array), Value::Array(items)) => {
            for item in items {
                gather(&array.fields, item, found);
            }
        }
        (FieldSchema::Object(object), Value::Object(map)) => {
            for (name, item) in map {
                if let Some(field) = object.fields.get(name) {
                    gather(field, item, found);
                }
            }
        }
        (FieldSchema::DynamicObject(dynamic), Value::Object(map)) => {
            for (key, item) in map {
                if let Some((_, field)) = dynamic.matching(key) {
                    gather(field, item, found);
                }
            }
        }
        _ => {}
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}
