use super::layout::{quote, ColumnType};
use super::plan::{AliasMap, Planner, QueryPlan};
use crate::error::{NestqlError, Result};
use crate::projection::field_at;
use crate::schema::{FieldSchema, Model, PRIMARY_KEY};
use crate::search::{format_date, parse_date, FilterValue, ResolvedSearch, SortOrder};
use serde::Serialize;
use serde_json::Value;

/// Name of the column carrying the number of matching roots.
pub const TOTAL: &str = "__total";

/// A positional statement parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Storage form of a JSON value for a column of type `ty`.
    pub fn from_column(ty: ColumnType, value: &Value) -> SqlValue {
        match (ty, value) {
            (_, Value::Null) => SqlValue::Null,
            (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            (ColumnType::Float, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or_default()),
            (ColumnType::Timestamp, Value::String(s)) => match parse_date(s) {
                Some(date) => SqlValue::Text(format_date(&date)),
                None => SqlValue::Text(s.clone()),
            },
            (ColumnType::Blob, Value::Array(items)) => SqlValue::Blob(
                items
                    .iter()
                    .filter_map(|b| b.as_u64().map(|b| b as u8))
                    .collect(),
            ),
            (_, Value::String(s)) => SqlValue::Text(s.clone()),
            (_, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            (_, Value::Number(n)) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            (_, other) => SqlValue::Text(other.to_string()),
        }
    }
}

/// A compiled statement with its positional parameters and the plan needed
/// to rebuild nested resources from its rows.
#[derive(Debug, Clone, Serialize)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub plan: QueryPlan,
    pub aliases: AliasMap,
}

/// A condition with the parameters it binds, in textual order.
struct Condition {
    sql: String,
    params: Vec<SqlValue>,
}

/// Compile a search into one SQL statement.
///
/// Every row carries the number of matching roots in `__total`. When the
/// projection reaches a to-many table, matching root ids are paginated first
/// and only the page is joined to the projection, so `LIMIT` counts roots
/// and not joined rows.
pub fn build_search_sql(model: &Model, search: &ResolvedSearch) -> Result<SqlQuery> {
    let mut planner = Planner::new(model);
    let mut plan = planner.root(&search.resource, &search.projection, false, None)?;
    let filter_plan = planner.root(
        &search.resource,
        &search.filter_tree,
        true,
        Some(&plan.table_alias),
    )?;
    let aliases = planner.alias_map(&[&plan, &filter_plan]);

    let expr_of = |path: &str| -> Result<String> {
        let alias = filter_plan
            .find(path)
            .ok_or_else(|| NestqlError::unknown(path))?;
        aliases
            .get(alias)
            .map(|target| target.expr.clone())
            .ok_or_else(|| NestqlError::unknown(path))
    };

    let mut conditions = Vec::new();
    for (path, filter) in &search.filters {
        let schema = field_at(model, &search.resource, path)?;
        conditions.push(filter_condition(&expr_of(path)?, path, schema, filter)?);
    }
    if let Some((on, tokens)) = &search.query {
        let mut alternatives = Vec::new();
        let mut params = Vec::new();
        for path in on {
            let expr = expr_of(path)?;
            let all: Vec<String> = tokens
                .iter()
                .map(|token| {
                    params.push(SqlValue::Text(format!("%{}%", escape_like(token))));
                    format!("LOWER({expr}) LIKE ? ESCAPE '\\'")
                })
                .collect();
            alternatives.push(format!("({})", all.join(" AND ")));
        }
        conditions.push(Condition {
            sql: format!("({})", alternatives.join(" OR ")),
            params,
        });
    }

    let mut sort = Vec::new();
    for (path, order) in &search.sort {
        sort.push((expr_of(path)?, *order));
    }

    plan.matches = conditions.iter().map(|c| c.sql.clone()).collect();
    plan.sort = sort.clone();

    let root_id = plan
        .row_id
        .clone()
        .ok_or_else(|| NestqlError::unknown(PRIMARY_KEY))?;
    let statement = Statement {
        plan: &plan,
        filter_plan: &filter_plan,
        conditions: &conditions,
        sort: &sort,
        root_id: &root_id,
        limit: search.limit.map_or(-1, |l| l as i64),
        offset: search.offset as i64,
    };
    let (sql, params) = if plan.has_to_many() {
        statement.paginate_roots()
    } else {
        statement.collapse_rows()
    };
    log::debug!("compiled search on '{}': {sql}", search.resource);

    Ok(SqlQuery {
        sql,
        params,
        plan,
        aliases,
    })
}

struct Statement<'a> {
    plan: &'a QueryPlan,
    filter_plan: &'a QueryPlan,
    conditions: &'a [Condition],
    sort: &'a [(String, SortOrder)],
    root_id: &'a str,
    limit: i64,
    offset: i64,
}

impl<'a> Statement<'a> {
    fn root_table(&self) -> String {
        format!(
            "{} AS {}",
            quote(&self.plan.structure),
            quote(&self.plan.table_alias)
        )
    }

    fn root_id_expr(&self) -> String {
        format!("{}.{}", quote(&self.plan.table_alias), quote(PRIMARY_KEY))
    }

    fn where_clause(&self, params: &mut Vec<SqlValue>) -> String {
        if self.conditions.is_empty() {
            return String::new();
        }
        let mut parts = Vec::new();
        for condition in self.conditions {
            parts.push(condition.sql.clone());
            params.extend(condition.params.iter().cloned());
        }
        format!(" WHERE {}", parts.join(" AND "))
    }

    fn sort_columns(&self) -> Vec<String> {
        self.sort
            .iter()
            .enumerate()
            .map(|(i, (expr, order))| {
                let aggregate = match order {
                    SortOrder::Asc => "MIN",
                    SortOrder::Desc => "MAX",
                };
                format!("{aggregate}({expr}) AS {}", quote(&sort_alias(i)))
            })
            .collect()
    }

    fn order_by(&self, scope: Option<&str>, root_id: &str) -> String {
        let qualify = |column: &str| match scope {
            Some(scope) => format!("{}.{}", quote(scope), quote(column)),
            None => quote(column),
        };
        let mut keys: Vec<String> = self
            .sort
            .iter()
            .enumerate()
            .map(|(i, (_, order))| format!("{} {}", qualify(&sort_alias(i)), order.sql()))
            .collect();
        keys.push(format!("{} ASC", qualify(root_id)));
        format!(" ORDER BY {}", keys.join(", "))
    }

    /// No to-many table in the projection: group the joined rows back into
    /// one row per root.
    fn collapse_rows(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let filter_joins = joins(self.filter_plan);

        let count = format!(
            "SELECT COUNT(DISTINCT {}) AS \"total\" FROM {}{}{}",
            self.root_id_expr(),
            self.root_table(),
            filter_joins,
            self.where_clause(&mut params)
        );

        let selected = self.plan.outer_columns();
        let mut select: Vec<String> = selected
            .iter()
            .map(|(expr, alias)| format!("{expr} AS {}", quote(alias)))
            .collect();
        select.extend(self.sort_columns());
        let mut group_by = vec![self.root_id_expr()];
        group_by.extend(selected.iter().map(|(expr, _)| expr.clone()));
        group_by.dedup();

        let page = format!(
            "SELECT DISTINCT {} FROM {}{}{}{} GROUP BY {}{} LIMIT ? OFFSET ?",
            select.join(", "),
            self.root_table(),
            joins(self.plan),
            filter_joins,
            self.where_clause(&mut params),
            group_by.join(", "),
            self.order_by(None, self.root_id),
        );
        params.push(SqlValue::Integer(self.limit));
        params.push(SqlValue::Integer(self.offset));

        let sql = format!(
            "WITH \"count\" AS ({count}), \"pagination\" AS ({page}) SELECT {} FROM \"count\" LEFT JOIN \"pagination\" ON 1 = 1{}",
            outer_select("pagination", &selected),
            self.order_by(Some("pagination"), self.root_id),
        );
        (sql, params)
    }

    /// A to-many table in the projection: paginate distinct root ids, then
    /// join only that page to the projection.
    fn paginate_roots(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut search_columns = vec![format!("{} AS \"__rootId\"", self.root_id_expr())];
        search_columns.extend(self.sort_columns());

        let search_results = format!(
            "SELECT {} FROM {}{}{} GROUP BY {}",
            search_columns.join(", "),
            self.root_table(),
            joins(self.filter_plan),
            self.where_clause(&mut params),
            self.root_id_expr(),
        );
        let count = "SELECT COUNT(*) AS \"total\" FROM \"searchResults\"".to_string();
        let sort_keys: Vec<String> = (0..self.sort.len())
            .map(|i| format!("\"searchResults\".{}", quote(&sort_alias(i))))
            .collect();
        let mut pagination_columns =
            vec!["\"searchResults\".\"__rootId\" AS \"__rootId\"".to_string()];
        pagination_columns.extend(
            sort_keys
                .iter()
                .enumerate()
                .map(|(i, key)| format!("{key} AS {}", quote(&sort_alias(i)))),
        );
        let pagination = format!(
            "SELECT {} FROM \"searchResults\"{} LIMIT ? OFFSET ?",
            pagination_columns.join(", "),
            self.order_by(None, "__rootId"),
        );
        params.push(SqlValue::Integer(self.limit));
        params.push(SqlValue::Integer(self.offset));

        let selected = self.plan.outer_columns();
        let mut select: Vec<String> = selected
            .iter()
            .map(|(expr, alias)| format!("{expr} AS {}", quote(alias)))
            .collect();
        select.extend(
            (0..self.sort.len())
                .map(|i| format!("\"pagination\".{0} AS {0}", quote(&sort_alias(i)))),
        );
        let results = format!(
            "SELECT {} FROM \"pagination\" JOIN {} ON {} = \"pagination\".\"__rootId\"{}",
            select.join(", "),
            self.root_table(),
            self.root_id_expr(),
            joins(self.plan),
        );

        let sql = format!(
            "WITH \"searchResults\" AS ({search_results}), \"count\" AS ({count}), \"pagination\" AS ({pagination}), \"results\" AS ({results}) SELECT {} FROM \"count\" LEFT JOIN \"results\" ON 1 = 1{}",
            outer_select("results", &selected),
            self.order_by(Some("results"), self.root_id),
        );
        (sql, params)
    }
}

fn sort_alias(index: usize) -> String {
    format!("__sort{index}")
}

fn outer_select(scope: &str, selected: &[(String, String)]) -> String {
    let mut columns = vec![format!("\"count\".\"total\" AS {}", quote(TOTAL))];
    columns.extend(
        selected
            .iter()
            .map(|(_, alias)| format!("{0}.{1} AS {1}", quote(scope), quote(alias))),
    );
    columns.join(", ")
}

/// `LEFT JOIN` clauses of every lookup of a plan, rendered depth-first.
fn joins(plan: &QueryPlan) -> String {
    let mut sql = String::new();
    for lookup in plan.lookups.values() {
        let (Some(local), Some(foreign)) = (&lookup.local_field, &lookup.foreign_field) else {
            continue;
        };
        sql.push_str(&format!(
            " LEFT JOIN ({}) AS {} ON {}.{} = {}.{}",
            subquery(lookup),
            quote(&lookup.alias),
            quote(&plan.table_alias),
            quote(local),
            quote(&lookup.alias),
            quote(foreign),
        ));
    }
    sql
}

/// Subquery of one lookup, re-exporting the aliases of its whole subtree.
fn subquery(plan: &QueryPlan) -> String {
    let columns: Vec<String> = plan
        .outer_columns()
        .iter()
        .map(|(expr, alias)| format!("{expr} AS {}", quote(alias)))
        .collect();
    format!(
        "SELECT {} FROM {} AS {}{}",
        columns.join(", "),
        quote(&plan.structure),
        quote(&plan.table_alias),
        joins(plan),
    )
}

fn filter_condition(
    expr: &str,
    path: &str,
    schema: &FieldSchema,
    filter: &FilterValue,
) -> Result<Condition> {
    let condition = match filter {
        FilterValue::Equals(Value::Null) => Condition {
            sql: format!("{expr} IS NULL"),
            params: Vec::new(),
        },
        FilterValue::Equals(value) => Condition {
            sql: format!("{expr} = ?"),
            params: vec![filter_param(path, schema, value)?],
        },
        FilterValue::OneOf(values) if values.is_empty() => Condition {
            sql: "1 = 0".to_string(),
            params: Vec::new(),
        },
        FilterValue::OneOf(values) => {
            let params = values
                .iter()
                .map(|v| filter_param(path, schema, v))
                .collect::<Result<Vec<_>>>()?;
            let marks = vec!["?"; params.len()].join(", ");
            Condition {
                sql: format!("{expr} IN ({marks})"),
                params,
            }
        }
        FilterValue::DateRange(start, end) => Condition {
            sql: format!("{expr} >= ? AND {expr} <= ?"),
            params: vec![
                SqlValue::Text(format_date(start)),
                SqlValue::Text(format_date(end)),
            ],
        },
        FilterValue::Since(date) => Condition {
            sql: format!("{expr} >= ?"),
            params: vec![SqlValue::Text(format_date(date))],
        },
    };
    Ok(condition)
}

/// Coerce a filter value to the storage form of the filtered field.
fn filter_param(path: &str, schema: &FieldSchema, value: &Value) -> Result<SqlValue> {
    let ty = match schema {
        FieldSchema::Boolean(_) => ColumnType::Boolean,
        FieldSchema::Integer(_) => ColumnType::Integer,
        FieldSchema::Float(_) => ColumnType::Float,
        FieldSchema::Date(_) => ColumnType::Timestamp,
        FieldSchema::String(_) => ColumnType::Text,
        FieldSchema::Id(_) => ColumnType::Id,
        other => {
            return Err(NestqlError::invalid(
                path,
                format!("cannot filter on a {} field", other.kind_name()),
            ))
        }
    };
    let matches_type = match ty {
        ColumnType::Boolean => value.is_boolean(),
        ColumnType::Integer | ColumnType::Float => value.is_number(),
        _ => value.is_string(),
    };
    if !matches_type && !value.is_null() {
        return Err(NestqlError::invalid(
            path,
            format!(
                "filter value {value} does not match a {} field",
                schema.kind_name()
            ),
        ));
    }
    Ok(SqlValue::from_column(ty, value))
}

fn escape_like(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for c in token.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
