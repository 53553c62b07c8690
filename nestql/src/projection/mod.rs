use crate::error::{NestqlError, Result};
use crate::schema::{DynamicObjectField, FieldSchema, Fields, Model, PRIMARY_KEY};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Requested shape of a resource: field name → whole subtree or a nested
/// selection.
pub type ProjectionTree = BTreeMap<String, Projection>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Whole,
    Nested(ProjectionTree),
}

impl Projection {
    pub fn is_whole(&self) -> bool {
        matches!(self, Projection::Whole)
    }

    pub fn subtree(&self) -> Option<&ProjectionTree> {
        match self {
            Projection::Whole => None,
            Projection::Nested(tree) => Some(tree),
        }
    }
}

impl Serialize for Projection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Projection::Whole => serializer.serialize_bool(true),
            Projection::Nested(tree) => tree.serialize(serializer),
        }
    }
}

// ── Merging ──────────────────────────────────────────────────────

/// Insert one path. A deeper path replaces a `Whole` sibling; a `Whole`
/// never replaces a nested selection.
pub fn insert_path(tree: &mut ProjectionTree, segments: &[&str]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        tree.entry(first.to_string()).or_insert(Projection::Whole);
        return;
    }
    let entry = tree
        .entry(first.to_string())
        .or_insert_with(|| Projection::Nested(ProjectionTree::new()));
    if entry.is_whole() {
        *entry = Projection::Nested(ProjectionTree::new());
    }
    if let Projection::Nested(subtree) = entry {
        insert_path(subtree, rest);
    }
}

/// Fold `other` into `tree` with the same rule as [`insert_path`].
pub fn merge(tree: &mut ProjectionTree, other: &ProjectionTree) {
    for (key, projection) in other {
        match projection {
            Projection::Whole => {
                tree.entry(key.clone()).or_insert(Projection::Whole);
            }
            Projection::Nested(subtree) => {
                let entry = tree
                    .entry(key.clone())
                    .or_insert_with(|| Projection::Nested(ProjectionTree::new()));
                if entry.is_whole() {
                    *entry = Projection::Nested(ProjectionTree::new());
                }
                if let Projection::Nested(target) = entry {
                    merge(target, subtree);
                }
            }
        }
    }
}

// ── Resolution ───────────────────────────────────────────────────

enum Scope<'a> {
    Fields(&'a Fields),
    Dynamic(&'a DynamicObjectField),
}

struct ResolvedPath<'a> {
    segments: Vec<&'a str>,
    /// Segment counts after which a relation re-roots the walk.
    relation_prefixes: Vec<usize>,
}

/// Resolve dotted field paths into a projection tree.
///
/// Arrays are transparent, dynamic objects match keys against their
/// patterns in order, and every relation crossed counts one level of depth.
/// With `require_indexed` every path must end on a unique or indexed scalar
/// (filter and sort position).
pub fn resolve(
    model: &Model,
    resource: &str,
    paths: &[String],
    max_depth: usize,
    require_indexed: bool,
) -> Result<ProjectionTree> {
    let root = model.resource(resource)?;
    let mut tree = ProjectionTree::new();

    if paths.is_empty() {
        for name in root.fields.keys() {
            tree.insert(name.clone(), Projection::Whole);
        }
        return Ok(tree);
    }

    for path in paths {
        let resolved = walk(model, resource, path, max_depth, require_indexed)?;
        insert_path(&mut tree, &resolved.segments);
        for &prefix in &resolved.relation_prefixes {
            let mut with_key = resolved.segments[..prefix].to_vec();
            with_key.push(PRIMARY_KEY);
            insert_path(&mut tree, &with_key);
        }
    }
    tree.entry(PRIMARY_KEY.to_string()).or_insert(Projection::Whole);
    Ok(tree)
}

/// Terminal schema of a path, with array layers stripped.
pub fn field_at<'m>(model: &'m Model, resource: &str, path: &str) -> Result<&'m FieldSchema> {
    let mut scope = Scope::Fields(&model.resource(resource)?.fields);
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let schema = lookup(&scope, segment, &segments[..=i])?.innermost();
        if i + 1 == segments.len() {
            return Ok(schema);
        }
        scope = descend(model, schema, path)?;
    }
    Err(NestqlError::unknown(path))
}

fn walk<'p>(
    model: &Model,
    resource: &str,
    path: &'p str,
    max_depth: usize,
    require_indexed: bool,
) -> Result<ResolvedPath<'p>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(NestqlError::unknown(path));
    }

    let mut scope = Scope::Fields(&model.resource(resource)?.fields);
    let mut relation_prefixes = Vec::new();
    let mut depth = 0;

    for (i, segment) in segments.iter().enumerate() {
        let schema = lookup(&scope, segment, &segments[..=i])?.innermost();

        if i + 1 == segments.len() {
            if require_indexed {
                if !schema.is_scalar() {
                    return Err(NestqlError::invalid(
                        path,
                        format!("cannot filter or sort on a {} field", schema.kind_name()),
                    ));
                }
                if !schema.is_indexed() {
                    return Err(NestqlError::UnindexedField {
                        path: path.to_string(),
                    });
                }
            }
            break;
        }

        if schema.relation().is_some() {
            depth += 1;
            if depth > max_depth {
                return Err(NestqlError::MaximumDepthExceeded {
                    path: segments[..=i].join("."),
                    max_depth,
                });
            }
            relation_prefixes.push(i + 1);
        }
        scope = descend(model, schema, path)?;
    }

    Ok(ResolvedPath {
        segments,
        relation_prefixes,
    })
}

fn lookup<'a>(scope: &Scope<'a>, segment: &str, walked: &[&str]) -> Result<&'a FieldSchema> {
    let found = match scope {
        Scope::Fields(fields) => fields.get(segment),
        Scope::Dynamic(dynamic) => dynamic.matching(segment).map(|(_, schema)| schema),
    };
    found.ok_or_else(|| NestqlError::unknown(walked.join(".")))
}

fn descend<'a>(model: &'a Model, schema: &'a FieldSchema, path: &str) -> Result<Scope<'a>> {
    match schema {
        FieldSchema::Object(object) => Ok(Scope::Fields(&object.fields)),
        FieldSchema::DynamicObject(dynamic) => Ok(Scope::Dynamic(dynamic)),
        FieldSchema::Id(id) => match &id.relation {
            Some(target) => Ok(Scope::Fields(&model.resource(target)?.fields)),
            None => Err(NestqlError::invalid(path, "id without relation has no nested fields")),
        },
        other => Err(NestqlError::invalid(
            path,
            format!("{} field has no nested fields", other.kind_name()),
        )),
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
resources:
  users:
    fields:
      name: { type: string, index: true }
      bio: { type: string }
      company: { type: id, relation: companies }
  companies:
    fields:
      name: { type: string, unique: true }
      owner: { type: id, relation: users }
  posts:
    fields:
      title: { type: string, index: true }
      author: { type: id, relation: users, index: true }
      tags:
        type: array
        fields: { type: string, index: true }
      comments:
        type: array
        fields:
          type: object
          fields:
            text: { type: string }
            by: { type: id, relation: users }
      extra:
        type: dynamic_object
        fields:
          "^n_": { type: integer }
"#,
        )
        .unwrap()
    }

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_nested_relation() {
        let model = model();
        let result = resolve(&model, "posts", &paths(&["title", "author.name"]), 3, false).unwrap();
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "_id": true,
                "title": true,
                "author": { "_id": true, "name": true }
            })
        );
    }

    #[test]
    fn test_resolve_is_order_independent_and_idempotent() {
        let model = model();
        let a = resolve(&model, "posts", &paths(&["author", "author.name", "title"]), 3, false).unwrap();
        let b = resolve(&model, "posts", &paths(&["title", "author.name", "author"]), 3, false).unwrap();
        assert_eq!(a, b);

        let mut merged = a.clone();
        merge(&mut merged, &a);
        assert_eq!(merged, a);
        merge(&mut merged, &b);
        assert_eq!(merged, a);
    }

    #[test]
    fn test_nested_is_never_replaced_by_whole() {
        let mut base = ProjectionTree::new();
        insert_path(&mut base, &["author", "name"]);
        let mut whole = ProjectionTree::new();
        insert_path(&mut whole, &["author"]);
        merge(&mut base, &whole);
        assert!(!base["author"].is_whole());
    }

    #[test]
    fn test_empty_paths_select_every_root_field() {
        let model = model();
        let result = resolve(&model, "users", &[], 3, false).unwrap();
        let keys: Vec<_> = result.keys().cloned().collect();
        assert_eq!(keys, vec!["_id", "bio", "company", "name"]);
        assert!(result.values().all(Projection::is_whole));
    }

    #[test]
    fn test_arrays_are_transparent() {
        let model = model();
        let result = resolve(&model, "posts", &paths(&["comments.by.name"]), 1, false).unwrap();
        let comments = result["comments"].subtree().unwrap();
        let by = comments["by"].subtree().unwrap();
        assert!(by.contains_key("_id"));
        assert!(by.contains_key("name"));
    }

    #[test]
    fn test_depth_is_enforced() {
        let model = model();
        assert!(resolve(&model, "posts", &paths(&["author.company.name"]), 2, false).is_ok());
        let err = resolve(&model, "posts", &paths(&["author.company.name"]), 1, false).unwrap_err();
        assert!(matches!(
            err,
            NestqlError::MaximumDepthExceeded { ref path, max_depth: 1 } if path == "author.company"
        ));
        // A relation requested as an id does not count.
        assert!(resolve(&model, "posts", &paths(&["author"]), 0, false).is_ok());
    }

    #[test]
    fn test_unknown_field() {
        let model = model();
        let err = resolve(&model, "posts", &paths(&["author.nickname"]), 3, false).unwrap_err();
        assert!(matches!(err, NestqlError::UnknownField { ref path } if path == "author.nickname"));
        let err = resolve(&model, "posts", &paths(&["extra.other"]), 3, false).unwrap_err();
        assert!(matches!(err, NestqlError::UnknownField { .. }));
    }

    #[test]
    fn test_descending_into_scalar_is_invalid() {
        let model = model();
        let err = resolve(&model, "posts", &paths(&["title.length"]), 3, false).unwrap_err();
        assert!(matches!(err, NestqlError::InvalidField { .. }));
    }

    #[test]
    fn test_indexing_guard() {
        let model = model();
        assert!(resolve(&model, "posts", &paths(&["title", "author.name", "tags"]), 3, true).is_ok());

        let err = resolve(&model, "posts", &paths(&["author.bio"]), 3, true).unwrap_err();
        assert!(matches!(err, NestqlError::UnindexedField { ref path } if path == "author.bio"));

        let err = resolve(&model, "posts", &paths(&["comments"]), 3, true).unwrap_err();
        assert!(matches!(err, NestqlError::InvalidField { .. }));
    }

    #[test]
    fn test_field_at() {
        let model = model();
        assert!(matches!(
            field_at(&model, "posts", "author.company.name").unwrap(),
            FieldSchema::String(_)
        ));
        assert!(matches!(field_at(&model, "posts", "tags").unwrap(), FieldSchema::String(_)));
        assert!(matches!(field_at(&model, "posts", "extra.n_1").unwrap(), FieldSchema::Integer(_)));
    }
}
