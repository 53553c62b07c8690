use crate::relational::layout::{quote, ColumnType, ROW_ID};
use crate::relational::metadata::ConstraintMetadata;
use crate::relational::{Catalog, StructureMetadata};
use std::collections::BTreeMap;

// ── DDL ──────────────────────────────────────────────────────────

/// `CREATE TABLE` and `CREATE INDEX` statements for every table of a
/// resource, parents first.
pub fn create_statements(structures: &[&StructureMetadata]) -> Vec<String> {
    let mut statements = Vec::new();
    for structure in structures {
        statements.push(create_table(structure));
        for index in &structure.indexes {
            statements.push(create_index(&structure.name, &index.column, index.unique));
        }
    }
    statements
}

fn create_table(structure: &StructureMetadata) -> String {
    let mut lines: Vec<String> = structure
        .fields
        .iter()
        .map(|(column, meta)| column_definition(column, meta.ty, meta.is_required))
        .collect();
    for constraint in &structure.constraints {
        lines.push(format!(
            "FOREIGN KEY ({}) {}",
            quote(&constraint.column),
            references(constraint)
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(&structure.name),
        lines.join(",\n    ")
    )
}

fn column_definition(column: &str, ty: ColumnType, required: bool) -> String {
    let mut definition = format!("{} {}", quote(column), ty.sql_type());
    if column == ROW_ID {
        definition.push_str(" NOT NULL PRIMARY KEY");
    } else if required {
        definition.push_str(" NOT NULL");
    }
    definition
}

fn references(constraint: &ConstraintMetadata) -> String {
    let mut clause = format!(
        "REFERENCES {} ({})",
        quote(&constraint.references_table),
        quote(&constraint.references_column)
    );
    if constraint.cascade {
        clause.push_str(" ON DELETE CASCADE");
    }
    clause
}

fn index_name(table: &str, column: &str) -> String {
    format!("idx_{table}_{column}")
}

fn create_index(table: &str, column: &str, unique: bool) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        quote(&index_name(table, column)),
        quote(table),
        quote(column)
    )
}

// ── Diffing ──────────────────────────────────────────────────────

/// A single storage change between two catalogs.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaMigration {
    TableAdded { table: String },
    TableRemoved { table: String },
    ColumnAdded {
        table: String,
        column: String,
        ty: ColumnType,
        required: bool,
    },
    ColumnRemoved { table: String, column: String },
    ColumnTypeChanged {
        table: String,
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    RequirednessChanged {
        table: String,
        column: String,
        required: bool,
    },
    IndexAdded {
        table: String,
        column: String,
        unique: bool,
    },
    IndexRemoved { table: String, column: String },
}

impl SchemaMigration {
    /// Whether this migration can be applied without touching stored rows.
    pub fn is_safe(&self) -> bool {
        match self {
            SchemaMigration::TableAdded { .. } => true,
            SchemaMigration::ColumnAdded { required, .. } => !*required,
            SchemaMigration::IndexAdded { unique, .. } => !*unique,
            SchemaMigration::IndexRemoved { .. } => true,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaMigration::TableAdded { table } => format!("Table '{table}' added"),
            SchemaMigration::TableRemoved { table } => {
                format!("Table '{table}' removed (data preserved)")
            }
            SchemaMigration::ColumnAdded {
                table,
                column,
                required,
                ..
            } => {
                let qualifier = if *required {
                    " (required, existing rows have no value: ERROR)"
                } else {
                    " (nullable)"
                };
                format!("Column '{table}.{column}' added{qualifier}")
            }
            SchemaMigration::ColumnRemoved { table, column } => {
                format!("Column '{table}.{column}' removed")
            }
            SchemaMigration::ColumnTypeChanged {
                table,
                column,
                from,
                to,
            } => format!(
                "Column '{table}.{column}' type changed from {} to {} (ERROR)",
                from.sql_type(),
                to.sql_type()
            ),
            SchemaMigration::RequirednessChanged {
                table,
                column,
                required,
            } => {
                let now = if *required { "required" } else { "optional" };
                format!("Column '{table}.{column}' is now {now}")
            }
            SchemaMigration::IndexAdded {
                table,
                column,
                unique,
            } => {
                let kind = if *unique { "Unique index" } else { "Index" };
                format!("{kind} on '{table}.{column}' added")
            }
            SchemaMigration::IndexRemoved { table, column } => {
                format!("Index on '{table}.{column}' removed")
            }
        }
    }

    /// Statements applying a safe migration; unsafe migrations have none.
    pub fn statements(&self, catalog: &Catalog) -> Vec<String> {
        if !self.is_safe() {
            return Vec::new();
        }
        match self {
            SchemaMigration::TableAdded { table } => tables(catalog)
                .remove(table.as_str())
                .map(|structure| create_statements(&[structure]))
                .unwrap_or_default(),
            SchemaMigration::ColumnAdded {
                table,
                column,
                ty,
                required,
            } => {
                let mut definition = column_definition(column, *ty, *required);
                let constraint = tables(catalog).get(table.as_str()).and_then(|structure| {
                    structure.constraints.iter().find(|c| &c.column == column)
                });
                if let Some(constraint) = constraint {
                    definition.push(' ');
                    definition.push_str(&references(constraint));
                }
                vec![format!("ALTER TABLE {} ADD COLUMN {}", quote(table), definition)]
            }
            SchemaMigration::IndexAdded {
                table,
                column,
                unique,
            } => vec![create_index(table, column, *unique)],
            SchemaMigration::IndexRemoved { table, column } => vec![format!(
                "DROP INDEX IF EXISTS {}",
                quote(&index_name(table, column))
            )],
            _ => Vec::new(),
        }
    }
}

fn tables(catalog: &Catalog) -> BTreeMap<&str, &StructureMetadata> {
    catalog
        .resources()
        .flat_map(|metadata| metadata.structures.values())
        .map(|structure| (structure.name.as_str(), structure))
        .collect()
}

/// Compare the tables of two catalogs.
pub fn diff_catalogs(old: &Catalog, new: &Catalog) -> Vec<SchemaMigration> {
    let old_tables = tables(old);
    let new_tables = tables(new);
    let mut migrations = Vec::new();

    for (name, structure) in &new_tables {
        let Some(previous) = old_tables.get(name) else {
            migrations.push(SchemaMigration::TableAdded {
                table: name.to_string(),
            });
            continue;
        };

        for (column, meta) in &structure.fields {
            match previous.fields.get(column) {
                None => migrations.push(SchemaMigration::ColumnAdded {
                    table: name.to_string(),
                    column: column.clone(),
                    ty: meta.ty,
                    required: meta.is_required,
                }),
                Some(old_meta) => {
                    if old_meta.ty != meta.ty {
                        migrations.push(SchemaMigration::ColumnTypeChanged {
                            table: name.to_string(),
                            column: column.clone(),
                            from: old_meta.ty,
                            to: meta.ty,
                        });
                    }
                    if old_meta.is_required != meta.is_required {
                        migrations.push(SchemaMigration::RequirednessChanged {
                            table: name.to_string(),
                            column: column.clone(),
                            required: meta.is_required,
                        });
                    }
                }
            }
        }
        for column in previous.fields.keys() {
            if !structure.fields.contains_key(column) {
                migrations.push(SchemaMigration::ColumnRemoved {
                    table: name.to_string(),
                    column: column.clone(),
                });
            }
        }

        for index in &structure.indexes {
            if !previous.indexes.contains(index) {
                migrations.push(SchemaMigration::IndexAdded {
                    table: name.to_string(),
                    column: index.column.clone(),
                    unique: index.unique,
                });
            }
        }
        for index in &previous.indexes {
            if !structure.indexes.contains(index) {
                migrations.push(SchemaMigration::IndexRemoved {
                    table: name.to_string(),
                    column: index.column.clone(),
                });
            }
        }
    }

    for name in old_tables.keys() {
        if !new_tables.contains_key(name) {
            migrations.push(SchemaMigration::TableRemoved {
                table: name.to_string(),
            });
        }
    }

    migrations
}

/// Migrations that would block applying a new model.
pub fn unsafe_migrations(migrations: &[SchemaMigration]) -> Vec<&SchemaMigration> {
    migrations.iter().filter(|m| !m.is_safe()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_model_str;
    use pretty_assertions::assert_eq;

    fn catalog(yaml: &str) -> Catalog {
        Catalog::new(&parse_model_str(yaml).unwrap()).unwrap()
    }

    const BASE: &str = r#"
resources:
  users:
    fields:
      email: { type: string, required: true, unique: true }
  posts:
    fields:
      title: { type: string, required: true }
      author: { type: id, relation: users, index: true }
      tags: { type: array, fields: { type: string } }
"#;

    #[test]
    fn test_create_statements() {
        let catalog = catalog(BASE);
        let posts = catalog.resource("posts").unwrap();
        let structures: Vec<&StructureMetadata> = posts.structures.values().collect();
        let statements = create_statements(&structures);
        assert_eq!(
            statements[0],
            "CREATE TABLE IF NOT EXISTS \"posts\" (\n    \
             \"_id\" TEXT NOT NULL PRIMARY KEY,\n    \
             \"title\" TEXT NOT NULL,\n    \
             \"author\" TEXT,\n    \
             FOREIGN KEY (\"author\") REFERENCES \"users\" (\"_id\")\n)"
        );
        assert!(statements.contains(
            &"CREATE INDEX IF NOT EXISTS \"idx_posts_author\" ON \"posts\" (\"author\")".to_string()
        ));
        let tags = statements
            .iter()
            .find(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"posts_tags\""))
            .unwrap();
        assert!(tags.contains("FOREIGN KEY (\"_parentId\") REFERENCES \"posts\" (\"_id\") ON DELETE CASCADE"));
    }

    #[test]
    fn test_statements_run_against_sqlite() {
        let catalog = catalog(BASE);
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        for metadata in catalog.resources() {
            let structures: Vec<&StructureMetadata> = metadata.structures.values().collect();
            for statement in create_statements(&structures) {
                conn.execute_batch(&statement).unwrap();
            }
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_diff_no_changes() {
        assert!(diff_catalogs(&catalog(BASE), &catalog(BASE)).is_empty());
    }

    #[test]
    fn test_diff_optional_field_added_is_safe() {
        let new = BASE.replace(
            "      tags:",
            "      summary: { type: string, index: true }\n      tags:",
        );
        let diffs = diff_catalogs(&catalog(BASE), &catalog(&new));
        assert_eq!(
            diffs,
            vec![
                SchemaMigration::ColumnAdded {
                    table: "posts".into(),
                    column: "summary".into(),
                    ty: ColumnType::Text,
                    required: false,
                },
                SchemaMigration::IndexAdded {
                    table: "posts".into(),
                    column: "summary".into(),
                    unique: false,
                },
            ]
        );
        assert!(unsafe_migrations(&diffs).is_empty());
        assert_eq!(
            diffs[0].statements(&catalog(&new)),
            vec!["ALTER TABLE \"posts\" ADD COLUMN \"summary\" TEXT".to_string()]
        );
    }

    #[test]
    fn test_added_relation_keeps_its_foreign_key() {
        let new = BASE.replace(
            "      tags:",
            "      editor: { type: id, relation: users }\n      tags:",
        );
        let new_catalog = catalog(&new);
        let diffs = diff_catalogs(&catalog(BASE), &new_catalog);
        let statements = diffs[0].statements(&new_catalog);
        assert_eq!(
            statements,
            vec!["ALTER TABLE \"posts\" ADD COLUMN \"editor\" TEXT REFERENCES \"users\" (\"_id\")".to_string()]
        );

        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        for metadata in catalog(BASE).resources() {
            let structures: Vec<&StructureMetadata> = metadata.structures.values().collect();
            for statement in create_statements(&structures) {
                conn.execute_batch(&statement).unwrap();
            }
        }
        conn.execute_batch(&statements[0]).unwrap();
        conn.execute("INSERT INTO \"posts\" (\"_id\", \"title\") VALUES ('p1', 't')", [])
            .unwrap();
        assert!(conn
            .execute("UPDATE \"posts\" SET \"editor\" = 'nobody' WHERE \"_id\" = 'p1'", [])
            .is_err());
    }

    #[test]
    fn test_diff_type_change_and_removed_table_are_unsafe() {
        let new = r#"
resources:
  users:
    fields:
      email: { type: integer, required: true, unique: true }
  posts:
    fields:
      title: { type: string, required: true }
      author: { type: id, relation: users, index: true }
"#;
        let diffs = diff_catalogs(&catalog(BASE), &catalog(new));
        assert!(diffs.iter().any(|d| matches!(
            d,
            SchemaMigration::ColumnTypeChanged { column, from: ColumnType::Text, to: ColumnType::Integer, .. }
                if column == "email"
        )));
        assert!(diffs
            .iter()
            .any(|d| matches!(d, SchemaMigration::TableRemoved { table } if table == "posts_tags")));
        assert_eq!(unsafe_migrations(&diffs).len(), 2);
        assert!(diffs.iter().all(|d| !d.describe().is_empty()));
    }

    #[test]
    fn test_new_table_statements() {
        let new = BASE.replace(
            "      tags:",
            "      links: { type: array, fields: { type: string } }\n      tags:",
        );
        let new_catalog = catalog(&new);
        let diffs = diff_catalogs(&catalog(BASE), &new_catalog);
        assert_eq!(
            diffs,
            vec![SchemaMigration::TableAdded {
                table: "posts_links".into()
            }]
        );
        let statements = diffs[0].statements(&new_catalog);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"posts_links\""));
    }
}
