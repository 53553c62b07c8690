use super::layout::{
    column_name, join_path, pattern_table, placement, sub_table, ColumnType, Placement, KEY,
    PARENT_ID, RESOURCE_ID, ROW_ID, VALUE,
};
use crate::error::{NestqlError, Result};
use crate::schema::{FieldSchema, Model};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadata {
    #[serde(rename = "type")]
    pub ty: ColumnType,
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMetadata {
    pub column: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintMetadata {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    /// Linkage of a synthetic table to its parent; deleting the parent row
    /// removes the child rows.
    pub cascade: bool,
}

/// One table of a resource: the root table or a synthetic sub-table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructureMetadata {
    pub name: String,
    pub parent: Option<String>,
    /// Model path of the values stored in this table.
    pub path: String,
    pub fields: IndexMap<String, ColumnMetadata>,
    pub indexes: Vec<IndexMetadata>,
    pub constraints: Vec<ConstraintMetadata>,
    pub sub_structures: Vec<String>,
    pub sub_structures_per_path: IndexMap<String, String>,
}

impl StructureMetadata {
    fn new(name: String, parent: Option<String>, path: String) -> Self {
        StructureMetadata {
            name,
            parent,
            path,
            fields: IndexMap::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            sub_structures: Vec::new(),
            sub_structures_per_path: IndexMap::new(),
        }
    }

    fn add_column(&mut self, column: &str, ty: ColumnType, is_required: bool) -> Result<()> {
        if self.fields.contains_key(column) {
            return Err(NestqlError::Schema(format!(
                "Column '{column}' of table '{}' is generated twice",
                self.name
            )));
        }
        self.fields
            .insert(column.to_string(), ColumnMetadata { ty, is_required });
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetadata {
    pub resource: String,
    /// Structures in parent-before-child order; the first is the root table.
    pub structures: IndexMap<String, StructureMetadata>,
    /// Tables holding relation columns that point at this resource.
    pub inverted_relations: BTreeMap<String, Vec<String>>,
}

impl ResourceMetadata {
    pub fn root(&self) -> &StructureMetadata {
        &self.structures[0]
    }

    pub fn structure(&self, name: &str) -> Option<&StructureMetadata> {
        self.structures.get(name)
    }

    /// Every table below `table`, parents first.
    pub fn descendants(&self, table: &str) -> Vec<&str> {
        let mut found: Vec<&str> = Vec::new();
        for structure in self.structures.values() {
            if let Some(parent) = &structure.parent {
                if parent == table || found.contains(&parent.as_str()) {
                    found.push(&structure.name);
                }
            }
        }
        found
    }
}

/// Value a synthetic table stores in its `value*` columns.
struct PendingTable<'a> {
    name: String,
    parent: String,
    path: String,
    value: &'a FieldSchema,
    keyed: bool,
}

struct Generator<'a> {
    resource: &'a str,
    inline_threshold: usize,
}

impl<'a> Generator<'a> {
    fn root(&self, model: &'a Model) -> Result<Vec<StructureMetadata>> {
        let schema = model.resource(self.resource)?;
        let mut root = StructureMetadata::new(self.resource.to_string(), None, String::new());
        let mut pending = Vec::new();

        for (name, field) in &schema.fields {
            self.add_value(&mut root, name, field, 0, name, true, &mut pending)?;
        }

        let mut structures = vec![root];
        for table in pending {
            structures.extend(self.synthetic(table)?);
        }
        Ok(structures)
    }

    fn synthetic(&self, table: PendingTable<'a>) -> Result<Vec<StructureMetadata>> {
        let mut structure =
            StructureMetadata::new(table.name, Some(table.parent.clone()), table.path.clone());
        structure.add_column(ROW_ID, ColumnType::Id, true)?;
        structure.add_column(PARENT_ID, ColumnType::Id, true)?;
        structure.add_column(RESOURCE_ID, ColumnType::Id, true)?;
        for (column, target) in [(PARENT_ID, table.parent.as_str()), (RESOURCE_ID, self.resource)] {
            structure.indexes.push(IndexMetadata {
                column: column.to_string(),
                unique: false,
            });
            structure.constraints.push(ConstraintMetadata {
                column: column.to_string(),
                references_table: target.to_string(),
                references_column: ROW_ID.to_string(),
                cascade: true,
            });
        }
        if table.keyed {
            structure.add_column(KEY, ColumnType::Text, true)?;
        }

        let mut pending = Vec::new();
        self.add_value(
            &mut structure,
            VALUE,
            table.value,
            0,
            &table.path,
            true,
            &mut pending,
        )?;

        let mut structures = vec![structure];
        for child in pending {
            structures.extend(self.synthetic(child)?);
        }
        Ok(structures)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_value(
        &self,
        structure: &mut StructureMetadata,
        column: &str,
        schema: &'a FieldSchema,
        level: usize,
        path: &str,
        parents_required: bool,
        pending: &mut Vec<PendingTable<'a>>,
    ) -> Result<()> {
        let required = parents_required && schema.is_required();
        match placement(schema, level, self.inline_threshold) {
            Placement::Absent => {}
            Placement::Column(ty) => {
                structure.add_column(column, ty, required)?;
                if schema.is_unique() || schema.is_indexed() {
                    structure.indexes.push(IndexMetadata {
                        column: column.to_string(),
                        unique: schema.is_unique(),
                    });
                }
                if let Some(target) = schema.relation() {
                    structure.constraints.push(ConstraintMetadata {
                        column: column.to_string(),
                        references_table: target.to_string(),
                        references_column: ROW_ID.to_string(),
                        cascade: false,
                    });
                }
            }
            Placement::Inline(object) => {
                structure.add_column(column, ColumnType::Boolean, required)?;
                for (name, field) in &object.fields {
                    self.add_value(
                        structure,
                        &column_name(column, name),
                        field,
                        level + 1,
                        &join_path(path, name),
                        required,
                        pending,
                    )?;
                }
            }
            Placement::Extracted(_) => {
                let name = sub_table(&structure.name, column);
                self.register(structure, &name, path);
                pending.push(PendingTable {
                    name,
                    parent: structure.name.clone(),
                    path: path.to_string(),
                    value: schema,
                    keyed: false,
                });
            }
            Placement::Elements(array) => {
                let name = sub_table(&structure.name, column);
                let element_path = if column == VALUE && !structure.is_root() {
                    format!("{path}[]")
                } else {
                    path.to_string()
                };
                self.register(structure, &name, &element_path);
                pending.push(PendingTable {
                    name,
                    parent: structure.name.clone(),
                    path: element_path,
                    value: &array.fields,
                    keyed: false,
                });
            }
            Placement::Dynamic(dynamic) => {
                structure.add_column(column, ColumnType::Boolean, required)?;
                for (index, (_, field)) in dynamic.fields.iter().enumerate() {
                    let name = pattern_table(&structure.name, column, index);
                    let pattern_path = format!("{path}[{index}]");
                    self.register(structure, &name, &pattern_path);
                    pending.push(PendingTable {
                        name,
                        parent: structure.name.clone(),
                        path: pattern_path,
                        value: field,
                        keyed: true,
                    });
                }
            }
        }
        Ok(())
    }

    fn register(&self, structure: &mut StructureMetadata, table: &str, path: &str) {
        structure.sub_structures.push(table.to_string());
        structure
            .sub_structures_per_path
            .insert(path.to_string(), table.to_string());
    }
}

/// Derive the tables of one resource. Inverted relations are filled by
/// [`Catalog::new`], which sees the whole model.
pub fn generate(model: &Model, resource: &str) -> Result<ResourceMetadata> {
    let generator = Generator {
        resource,
        inline_threshold: model.settings.inline_threshold,
    };
    let structures = generator.root(model)?;
    Ok(ResourceMetadata {
        resource: resource.to_string(),
        structures: structures
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect(),
        inverted_relations: BTreeMap::new(),
    })
}

/// Table metadata of every resource of a model, derived once.
#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    resources: IndexMap<String, ResourceMetadata>,
    #[serde(skip)]
    owners: HashMap<String, String>,
}

impl Catalog {
    pub fn new(model: &Model) -> Result<Self> {
        let mut resources = IndexMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        for name in model.resource_names() {
            let metadata = generate(model, name)?;
            for table in metadata.structures.keys() {
                if let Some(owner) = owners.insert(table.clone(), name.to_string()) {
                    return Err(NestqlError::Schema(format!(
                        "Table '{table}' is generated by both '{owner}' and '{name}'"
                    )));
                }
            }
            resources.insert(name.to_string(), metadata);
        }

        let mut inverted: Vec<(String, String, String)> = Vec::new();
        for metadata in resources.values() {
            for structure in metadata.structures.values() {
                for constraint in structure.constraints.iter().filter(|c| !c.cascade) {
                    inverted.push((
                        constraint.references_table.clone(),
                        structure.name.clone(),
                        constraint.column.clone(),
                    ));
                }
            }
        }
        for (target, table, column) in inverted {
            if let Some(metadata) = resources.get_mut(&target) {
                metadata
                    .inverted_relations
                    .entry(table)
                    .or_default()
                    .push(column);
            }
        }

        Ok(Catalog { resources, owners })
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceMetadata> {
        self.resources
            .get(name)
            .ok_or_else(|| NestqlError::UnknownResource(name.to_string()))
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceMetadata> {
        self.resources.values()
    }

    /// Resource whose rows a table stores.
    pub fn owner(&self, table: &str) -> Option<&str> {
        self.owners.get(table).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_model_str;
    use pretty_assertions::assert_eq;

    fn model() -> Model {
        parse_model_str(
            r#"
settings:
  inline_threshold: 1

resources:
  users:
    fields:
      email: { type: string, required: true, unique: true }
  posts:
    enable_deletion: false
    fields:
      title: { type: string, required: true, index: true }
      author: { type: id, relation: users }
      profile:
        type: object
        fields:
          city: { type: string }
          geo:
            type: object
            fields:
              deep:
                type: object
                fields:
                  lat: { type: float }
      tags:
        type: array
        fields: { type: string }
      items:
        type: array
        fields:
          type: object
          fields:
            tag: { type: string }
            reviewer: { type: id, relation: users }
      matrix:
        type: array
        fields:
          type: array
          fields: { type: integer }
      meta:
        type: dynamic_object
        fields:
          "^n_": { type: integer }
          ".*": { type: string }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_root_columns() {
        let catalog = Catalog::new(&model()).unwrap();
        let posts = catalog.resource("posts").unwrap();
        let root = posts.root();
        let columns: Vec<&str> = root.fields.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            columns,
            vec!["_id", "title", "author", "profile", "profile_city", "profile_geo", "meta", "_isDeleted"]
        );
        assert!(root.fields["title"].is_required);
        assert!(!root.fields["profile_city"].is_required);
        assert_eq!(root.fields["_isDeleted"].ty, ColumnType::Boolean);
        assert!(root.indexes.contains(&IndexMetadata { column: "_id".into(), unique: true }));
        assert!(root.indexes.contains(&IndexMetadata { column: "title".into(), unique: false }));
    }

    #[test]
    fn test_synthetic_tables_parents_first() {
        let catalog = Catalog::new(&model()).unwrap();
        let posts = catalog.resource("posts").unwrap();
        let tables: Vec<&str> = posts.structures.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            tables,
            vec![
                "posts",
                "posts_profile_geo_deep",
                "posts_tags",
                "posts_items",
                "posts_matrix",
                "posts_matrix_value",
                "posts_meta_0",
                "posts_meta_1",
            ]
        );

        let items = posts.structure("posts_items").unwrap();
        let columns: Vec<&str> = items.fields.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            columns,
            vec!["_id", "_parentId", "_resourceId", "value", "value_tag", "value_reviewer"]
        );
        let meta = posts.structure("posts_meta_0").unwrap();
        assert!(meta.fields.contains_key("key"));
        assert_eq!(meta.fields["value"].ty, ColumnType::Integer);

        let root = posts.root();
        assert_eq!(root.sub_structures_per_path["matrix"], "posts_matrix");
        assert_eq!(
            posts.structure("posts_matrix").unwrap().sub_structures_per_path["matrix[]"],
            "posts_matrix_value"
        );
        assert_eq!(root.sub_structures_per_path["meta[1]"], "posts_meta_1");
    }

    #[test]
    fn test_descendants() {
        let catalog = Catalog::new(&model()).unwrap();
        let posts = catalog.resource("posts").unwrap();
        assert_eq!(posts.descendants("posts_matrix"), vec!["posts_matrix_value"]);
        assert_eq!(posts.descendants("posts").len(), posts.structures.len() - 1);
        assert!(posts.descendants("posts_tags").is_empty());
    }

    #[test]
    fn test_constraints_and_inverted_relations() {
        let catalog = Catalog::new(&model()).unwrap();
        let posts = catalog.resource("posts").unwrap();
        let items = posts.structure("posts_items").unwrap();
        assert!(items.constraints.contains(&ConstraintMetadata {
            column: "_parentId".into(),
            references_table: "posts".into(),
            references_column: "_id".into(),
            cascade: true,
        }));
        assert!(items.constraints.contains(&ConstraintMetadata {
            column: "value_reviewer".into(),
            references_table: "users".into(),
            references_column: "_id".into(),
            cascade: false,
        }));

        let users = catalog.resource("users").unwrap();
        assert_eq!(users.inverted_relations["posts"], vec!["author".to_string()]);
        assert_eq!(users.inverted_relations["posts_items"], vec!["value_reviewer".to_string()]);
        assert_eq!(catalog.owner("posts_items"), Some("posts"));
    }

    #[test]
    fn test_column_collision_is_a_schema_error() {
        let model = parse_model_str(
            r#"
resources:
  posts:
    fields:
      a_b: { type: string }
      a:
        type: object
        fields:
          b: { type: string }
"#,
        )
        .unwrap();
        assert!(matches!(Catalog::new(&model), Err(NestqlError::Schema(_))));
    }

    #[test]
    fn test_table_collision_is_a_schema_error() {
        let model = parse_model_str(
            r#"
resources:
  posts:
    fields:
      tags: { type: array, fields: { type: string } }
  posts_tags:
    fields:
      name: { type: string }
"#,
        )
        .unwrap();
        assert!(matches!(Catalog::new(&model), Err(NestqlError::Schema(_))));
    }
}
