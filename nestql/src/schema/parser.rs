use super::types::*;
use crate::error::{NestqlError, Result};
use indexmap::IndexMap;
use std::path::Path;

/// Parse a model YAML file into a validated Model
pub fn parse_model(path: &Path) -> Result<Model> {
    let content = std::fs::read_to_string(path)?;
    parse_model_str(&content)
}

/// Parse a model YAML string into a validated Model
pub fn parse_model_str(content: &str) -> Result<Model> {
    let definition: ModelDefinition = serde_yaml::from_str(content)?;
    build_model(definition)
}

/// Check a raw definition and add the primary key and automatic fields to
/// every resource.
pub fn build_model(definition: ModelDefinition) -> Result<Model> {
    let ModelDefinition {
        settings,
        resources,
    } = definition;

    let mut prepared = IndexMap::with_capacity(resources.len());
    for (name, resource) in resources {
        for field_name in resource.fields.keys() {
            check_field_name(&name, field_name)?;
            if field_name.starts_with('_') {
                return Err(NestqlError::Schema(format!(
                    "Resource '{name}': field '{field_name}' uses the reserved '_' prefix"
                )));
            }
        }
        let fields = with_automatic_fields(&resource, &settings.authors_resource);
        prepared.insert(name, ResourceSchema { fields, ..resource });
    }

    for (name, resource) in &prepared {
        for (field_name, schema) in &resource.fields {
            check_relations(&prepared, &format!("{name}.{field_name}"), schema)?;
        }
    }

    Ok(Model::new(settings, prepared))
}

fn with_automatic_fields(resource: &ResourceSchema, authors: &str) -> Fields {
    let mut fields = Fields::with_capacity(resource.fields.len() + 5);
    fields.insert(
        PRIMARY_KEY.into(),
        FieldSchema::Id(IdField {
            required: true,
            unique: true,
            ..Default::default()
        }),
    );
    for (name, schema) in &resource.fields {
        fields.insert(name.clone(), schema.clone());
    }

    if resource.soft_deletes() {
        fields.insert(
            IS_DELETED.into(),
            FieldSchema::Boolean(BooleanField {
                required: true,
                index: true,
            }),
        );
    }
    if resource.enable_timestamps {
        for (name, required) in [(CREATED_AT, true), (UPDATED_AT, false)] {
            fields.insert(
                name.into(),
                FieldSchema::Date(DateField {
                    required,
                    index: true,
                    ..Default::default()
                }),
            );
        }
    }
    if resource.enable_authors {
        for name in [CREATED_BY, UPDATED_BY] {
            fields.insert(
                name.into(),
                FieldSchema::Id(IdField {
                    relation: Some(authors.to_string()),
                    index: true,
                    ..Default::default()
                }),
            );
        }
    }
    fields
}

fn check_field_name(resource: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') {
        return Err(NestqlError::Schema(format!(
            "Resource '{resource}': invalid field name '{name}'"
        )));
    }
    Ok(())
}

fn check_relations(
    resources: &IndexMap<String, ResourceSchema>,
    path: &str,
    schema: &FieldSchema,
) -> Result<()> {
    match schema {
        FieldSchema::Id(IdField {
            relation: Some(target),
            ..
        }) => {
            if !resources.contains_key(target) {
                return Err(NestqlError::Schema(format!(
                    "Field '{path}' relates to unknown resource '{target}'"
                )));
            }
        }
        FieldSchema::Object(object) => {
            for (name, child) in &object.fields {
                check_field_name(path, name)?;
                check_relations(resources, &format!("{path}.{name}"), child)?;
            }
        }
        FieldSchema::Array(array) => check_relations(resources, path, &array.fields)?,
        FieldSchema::DynamicObject(dynamic) => {
            for (pattern, child) in &dynamic.fields {
                check_relations(resources, &format!("{path}.{}", pattern.as_str()), child)?;
            }
        }
        _ => {}
    }
    Ok(())
}
