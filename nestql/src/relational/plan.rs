use super::layout::{
    column_name, join_path, pattern_table, placement, quote, sub_table, ColumnType, Placement,
    KEY, PARENT_ID, ROW_ID, VALUE,
};
use crate::error::{NestqlError, Result};
use crate::projection::{Projection, ProjectionTree};
use crate::schema::{FieldSchema, Fields, Model, PRIMARY_KEY};
use crate::search::SortOrder;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Root,
    Relation,
    /// Object moved out of its parent row (single row).
    Embedded,
    /// Array elements.
    Elements,
    /// Keys of a dynamic object matching one pattern.
    Pattern,
}

impl LookupKind {
    pub fn is_to_many(&self) -> bool {
        matches!(self, LookupKind::Elements | LookupKind::Pattern)
    }
}

/// How a value is rebuilt from the selected columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Shape {
    Absent,
    Column {
        alias: String,
        #[serde(rename = "type")]
        ty: ColumnType,
    },
    Object {
        presence: Option<String>,
        fields: Vec<(String, Shape)>,
    },
    /// Value comes from the lookup registered under `path`.
    Lookup { path: String },
    Dynamic {
        presence: String,
        patterns: Vec<String>,
        /// Requested keys; `None` keeps every key.
        keys: Option<ProjectionTree>,
    },
}

/// One table instance of a statement and everything joined below it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub structure: String,
    /// Name of the joined subquery in the enclosing scope.
    pub alias: String,
    /// Name of the table inside its own scope.
    pub table_alias: String,
    pub kind: LookupKind,
    /// Model path → column alias, for value columns.
    pub fields: IndexMap<String, String>,
    /// `(column, alias)` selected from this table.
    pub columns: Vec<(String, String)>,
    pub lookups: IndexMap<String, QueryPlan>,
    /// Column of the parent table joined on.
    pub local_field: Option<String>,
    /// Alias exported by this plan that the parent joins against.
    pub foreign_field: Option<String>,
    pub to_many: bool,
    /// Alias identifying one row of this table instance.
    pub row_id: Option<String>,
    /// Alias of the dynamic key column.
    pub key: Option<String>,
    pub shape: Shape,
    /// Compiled conditions (root only).
    pub matches: Vec<String>,
    /// Sort expressions and directions (root only).
    pub sort: Vec<(String, SortOrder)>,
}

impl QueryPlan {
    fn new(structure: &str, alias: String, table_alias: String, kind: LookupKind) -> Self {
        QueryPlan {
            structure: structure.to_string(),
            alias,
            table_alias,
            kind,
            fields: IndexMap::new(),
            columns: Vec::new(),
            lookups: IndexMap::new(),
            local_field: None,
            foreign_field: None,
            to_many: kind.is_to_many(),
            row_id: None,
            key: None,
            shape: Shape::Absent,
            matches: Vec::new(),
            sort: Vec::new(),
        }
    }

    /// Every alias this plan makes visible to its parent.
    pub fn exported(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.columns.iter().map(|(_, a)| a.as_str()).collect();
        for lookup in self.lookups.values() {
            aliases.extend(lookup.exported());
        }
        aliases
    }

    /// Alias of the value column for a model path, searching lookups.
    pub fn find(&self, path: &str) -> Option<&str> {
        self.fields
            .get(path)
            .map(|a| a.as_str())
            .or_else(|| self.lookups.values().find_map(|l| l.find(path)))
    }

    pub fn has_to_many(&self) -> bool {
        self.lookups
            .values()
            .any(|l| l.to_many || l.has_to_many())
    }

    /// `(expression, alias)` of every exported column as seen from the scope
    /// that holds this plan's table.
    pub fn outer_columns(&self) -> Vec<(String, String)> {
        let mut columns: Vec<(String, String)> = self
            .columns
            .iter()
            .map(|(column, alias)| {
                (
                    format!("{}.{}", quote(&self.table_alias), quote(column)),
                    alias.clone(),
                )
            })
            .collect();
        for lookup in self.lookups.values() {
            for alias in lookup.exported() {
                columns.push((
                    format!("{}.{}", quote(&lookup.alias), quote(alias)),
                    alias.to_string(),
                ));
            }
        }
        columns
    }
}

// ── Aliases ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasRole {
    Value,
    Presence,
    RowId,
    Parent,
    Key,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasTarget {
    pub path: String,
    pub role: AliasRole,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Reference usable in the outermost scope of the statement.
    pub expr: String,
}

pub type AliasMap = IndexMap<String, AliasTarget>;

/// Hands out names unique within one statement: the base name first, then
/// `base_2`, `base_3`, ...
#[derive(Debug, Default)]
pub struct AliasAllocator {
    used: HashSet<String>,
}

impl AliasAllocator {
    pub fn allocate(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Alias base of a model path: segments joined with `_`.
fn alias_base(path: &str) -> String {
    path.replace(['.', '['], "_").replace(']', "")
}

// ── Planning ─────────────────────────────────────────────────────

/// Builds the projection and filter plans of one statement, sharing the
/// alias namespaces between them.
pub struct Planner<'m> {
    model: &'m Model,
    inline_threshold: usize,
    columns: AliasAllocator,
    tables: AliasAllocator,
    aliases: BTreeMap<String, (String, AliasRole, ColumnType)>,
    filtering: bool,
}

impl<'m> Planner<'m> {
    pub fn new(model: &'m Model) -> Self {
        Planner {
            model,
            inline_threshold: model.settings.inline_threshold,
            columns: AliasAllocator::default(),
            tables: AliasAllocator::default(),
            aliases: BTreeMap::new(),
            filtering: false,
        }
    }

    /// Plan the root of a statement. The filter plan reuses the projection
    /// plan's table alias so both read the same root row.
    pub fn root(
        &mut self,
        resource: &str,
        tree: &ProjectionTree,
        filtering: bool,
        table_alias: Option<&str>,
    ) -> Result<QueryPlan> {
        self.filtering = filtering;
        let alias = match table_alias {
            Some(alias) => alias.to_string(),
            None => self.tables.allocate(resource),
        };
        self.resource_scope(resource, tree, "", LookupKind::Root, alias.clone(), alias)
    }

    /// Alias targets of every allocated column, with outer expressions taken
    /// from the given root plans.
    pub fn alias_map(&self, roots: &[&QueryPlan]) -> AliasMap {
        let mut exprs = BTreeMap::new();
        for root in roots {
            for (expr, alias) in root.outer_columns() {
                exprs.insert(alias, expr);
            }
        }
        self.aliases
            .iter()
            .filter_map(|(alias, (path, role, ty))| {
                exprs.get(alias).map(|expr| {
                    (
                        alias.clone(),
                        AliasTarget {
                            path: path.clone(),
                            role: *role,
                            ty: *ty,
                            expr: expr.clone(),
                        },
                    )
                })
            })
            .collect()
    }

    fn column(
        &mut self,
        plan: &mut QueryPlan,
        column: &str,
        path: &str,
        base: &str,
        role: AliasRole,
        ty: ColumnType,
    ) -> String {
        let alias = self.columns.allocate(base);
        plan.columns.push((column.to_string(), alias.clone()));
        self.aliases
            .insert(alias.clone(), (path.to_string(), role, ty));
        alias
    }

    fn resource_scope(
        &mut self,
        resource: &str,
        tree: &ProjectionTree,
        path: &str,
        kind: LookupKind,
        alias: String,
        table_alias: String,
    ) -> Result<QueryPlan> {
        let model = self.model;
        let schema = model.resource(resource)?;
        let mut plan = QueryPlan::new(resource, alias, table_alias, kind);

        let mut tree = tree.clone();
        tree.entry(PRIMARY_KEY.to_string()).or_insert(Projection::Whole);
        let fields = self.object_fields(&mut plan, "", &schema.fields, &tree, path, 0)?;

        plan.row_id = plan.fields.get(&join_path(path, PRIMARY_KEY)).cloned();
        plan.shape = Shape::Object {
            presence: None,
            fields,
        };
        Ok(plan)
    }

    fn synthetic_scope(
        &mut self,
        table: String,
        value: &FieldSchema,
        projection: &Projection,
        path: &str,
        kind: LookupKind,
    ) -> Result<QueryPlan> {
        let table_alias = self.tables.allocate(&table);
        let alias = self.tables.allocate(&alias_base(path));
        let mut plan = QueryPlan::new(&table, alias, table_alias, kind);
        let base = alias_base(path);

        let row_id = self.column(
            &mut plan,
            ROW_ID,
            path,
            &format!("{base}__rowId"),
            AliasRole::RowId,
            ColumnType::Id,
        );
        let parent = self.column(
            &mut plan,
            PARENT_ID,
            path,
            &format!("{base}__parentId"),
            AliasRole::Parent,
            ColumnType::Id,
        );
        if kind == LookupKind::Pattern {
            plan.key = Some(self.column(
                &mut plan,
                KEY,
                path,
                &format!("{base}__key"),
                AliasRole::Key,
                ColumnType::Text,
            ));
        }
        plan.row_id = Some(row_id);
        plan.local_field = Some(ROW_ID.to_string());
        plan.foreign_field = Some(parent);
        plan.shape = self.value(&mut plan, VALUE, value, projection, path, 0)?;
        Ok(plan)
    }

    fn object_fields(
        &mut self,
        plan: &mut QueryPlan,
        prefix: &str,
        fields: &Fields,
        tree: &ProjectionTree,
        path: &str,
        level: usize,
    ) -> Result<Vec<(String, Shape)>> {
        for name in tree.keys() {
            if !fields.contains_key(name) {
                return Err(NestqlError::unknown(join_path(path, name)));
            }
        }
        let mut shapes = Vec::new();
        for (name, schema) in fields {
            if let Some(projection) = tree.get(name) {
                let shape = self.value(
                    plan,
                    &column_name(prefix, name),
                    schema,
                    projection,
                    &join_path(path, name),
                    level,
                )?;
                shapes.push((name.clone(), shape));
            }
        }
        Ok(shapes)
    }

    fn value(
        &mut self,
        plan: &mut QueryPlan,
        column: &str,
        schema: &FieldSchema,
        projection: &Projection,
        path: &str,
        level: usize,
    ) -> Result<Shape> {
        match placement(schema, level, self.inline_threshold) {
            Placement::Absent => Ok(Shape::Absent),
            Placement::Column(ty) => {
                let alias =
                    self.column(plan, column, path, &alias_base(path), AliasRole::Value, ty);
                plan.fields.insert(path.to_string(), alias.clone());

                match (schema.relation(), projection) {
                    (Some(target), Projection::Nested(subtree)) => {
                        let alias = self.tables.allocate(&alias_base(path));
                        let table_alias = self.tables.allocate(target);
                        let mut lookup = self.resource_scope(
                            target,
                            subtree,
                            path,
                            LookupKind::Relation,
                            alias,
                            table_alias,
                        )?;
                        lookup.local_field = Some(column.to_string());
                        lookup.foreign_field = lookup.row_id.clone();
                        plan.lookups.insert(path.to_string(), lookup);
                        Ok(Shape::Lookup {
                            path: path.to_string(),
                        })
                    }
                    _ => Ok(Shape::Column { alias, ty }),
                }
            }
            Placement::Inline(object) => {
                let presence = self.column(
                    plan,
                    column,
                    path,
                    &alias_base(path),
                    AliasRole::Presence,
                    ColumnType::Boolean,
                );
                let all;
                let tree = match projection {
                    Projection::Nested(tree) => tree,
                    Projection::Whole => {
                        all = whole_tree(&object.fields);
                        &all
                    }
                };
                let fields =
                    self.object_fields(plan, column, &object.fields, tree, path, level + 1)?;
                Ok(Shape::Object {
                    presence: Some(presence),
                    fields,
                })
            }
            Placement::Extracted(_) => {
                let table = sub_table(&plan.structure, column);
                let lookup =
                    self.synthetic_scope(table, schema, projection, path, LookupKind::Embedded)?;
                Ok(attach(plan, path, lookup))
            }
            Placement::Elements(array) => {
                let table = sub_table(&plan.structure, column);
                let lookup = self.synthetic_scope(
                    table,
                    &array.fields,
                    projection,
                    path,
                    LookupKind::Elements,
                )?;
                Ok(attach(plan, path, lookup))
            }
            Placement::Dynamic(dynamic) => {
                if self.filtering {
                    return Err(NestqlError::invalid(
                        path,
                        "fields of dynamic objects cannot be filtered or sorted",
                    ));
                }
                let presence = self.column(
                    plan,
                    column,
                    path,
                    &alias_base(path),
                    AliasRole::Presence,
                    ColumnType::Boolean,
                );
                let keys = projection.subtree().cloned();
                let mut patterns = Vec::new();
                for (index, (_, field)) in dynamic.fields.iter().enumerate() {
                    let requested = match &keys {
                        None => true,
                        Some(tree) => tree.keys().any(|key| {
                            dynamic
                                .matching(key)
                                .map_or(false, |(i, _)| i == index)
                        }),
                    };
                    if !requested {
                        continue;
                    }
                    let pattern_path = format!("{path}[{index}]");
                    let lookup = self.synthetic_scope(
                        pattern_table(&plan.structure, column, index),
                        field,
                        &Projection::Whole,
                        &pattern_path,
                        LookupKind::Pattern,
                    )?;
                    plan.lookups.insert(pattern_path.clone(), lookup);
                    patterns.push(pattern_path);
                }
                Ok(Shape::Dynamic {
                    presence,
                    patterns,
                    keys,
                })
            }
        }
    }

}

fn attach(plan: &mut QueryPlan, path: &str, lookup: QueryPlan) -> Shape {
    plan.lookups.insert(path.to_string(), lookup);
    Shape::Lookup {
        path: path.to_string(),
    }
}

fn whole_tree(fields: &Fields) -> ProjectionTree {
    fields
        .keys()
        .map(|name| (name.clone(), Projection::Whole))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::resolve;
    use crate::schema::parse_model_str;

    fn model() -> Model {
        parse_model_str(
            r#"
resources:
  users:
    fields:
      name: { type: string, index: true }
  posts:
    fields:
      title: { type: string, index: true }
      author: { type: id, relation: users, index: true }
      tags: { type: array, fields: { type: string, index: true } }
      meta:
        type: dynamic_object
        fields:
          "^n_": { type: integer }
          ".*": { type: string }
"#,
        )
        .unwrap()
    }

    fn plan(fields: &[&str]) -> (QueryPlan, AliasMap) {
        let model = model();
        let paths: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        let tree = resolve(&model, "posts", &paths, 3, false).unwrap();
        let mut planner = Planner::new(&model);
        let root = planner.root("posts", &tree, false, None).unwrap();
        let aliases = planner.alias_map(&[&root]);
        (root, aliases)
    }

    #[test]
    fn test_allocator_suffixes_collisions() {
        let mut allocator = AliasAllocator::default();
        assert_eq!(allocator.allocate("title"), "title");
        assert_eq!(allocator.allocate("title"), "title_2");
        assert_eq!(allocator.allocate("title"), "title_3");
    }

    #[test]
    fn test_relation_lookup() {
        let (root, aliases) = plan(&["title", "author.name"]);
        let author = &root.lookups["author"];
        assert_eq!(author.kind, LookupKind::Relation);
        assert_eq!(author.local_field.as_deref(), Some("author"));
        assert_eq!(author.foreign_field.as_deref(), Some("author__id"));
        assert_eq!(root.find("author.name"), Some("author_name"));
        assert!(!root.has_to_many());
        assert_eq!(aliases["author_name"].expr, "\"author\".\"author_name\"");
        assert_eq!(aliases["title"].expr, "\"posts\".\"title\"");
    }

    #[test]
    fn test_array_lookup_is_to_many() {
        let (root, aliases) = plan(&["tags"]);
        let tags = &root.lookups["tags"];
        assert!(tags.to_many);
        assert_eq!(tags.structure, "posts_tags");
        assert_eq!(tags.row_id.as_deref(), Some("tags__rowId"));
        assert_eq!(tags.foreign_field.as_deref(), Some("tags__parentId"));
        assert_eq!(aliases["tags"].role, AliasRole::Value);
        assert!(root.has_to_many());
    }

    #[test]
    fn test_dynamic_keys_join_matching_patterns_only() {
        let (root, _) = plan(&["meta.n_views"]);
        assert!(root.lookups.contains_key("meta[0]"));
        assert!(!root.lookups.contains_key("meta[1]"));
    }

    #[test]
    fn test_dynamic_filters_are_rejected() {
        let model = model();
        let mut tree = ProjectionTree::new();
        crate::projection::insert_path(&mut tree, &["meta", "n_views"]);
        let mut planner = Planner::new(&model);
        let err = planner.root("posts", &tree, true, None).unwrap_err();
        assert!(matches!(err, NestqlError::InvalidField { .. }));
    }
}
