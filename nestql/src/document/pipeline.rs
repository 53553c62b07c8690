use super::value::{date_to_bson, to_bson};
use crate::error::{NestqlError, Result};
use crate::projection::{field_at, Projection, ProjectionTree};
use crate::schema::{DynamicObjectField, FieldSchema, Fields, Model};
use crate::search::{format_date, sort_pairs, FilterValue, ResolvedSearch, SearchRequest, SortOrder};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Aggregation pipelines for one search: the page itself and the count of
/// every matching resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentQuery {
    pub collection: String,
    pub pipeline: Vec<Document>,
    pub count_pipeline: Vec<Document>,
    /// `false` for a zero limit: only the count is needed.
    pub fetch_results: bool,
}

impl DocumentQuery {
    /// Relaxed extended JSON form of both pipelines.
    pub fn to_json(&self) -> serde_json::Value {
        let stages = |pipeline: &[Document]| -> Vec<serde_json::Value> {
            pipeline
                .iter()
                .map(|stage| Bson::Document(stage.clone()).into_relaxed_extjson())
                .collect()
        };
        serde_json::json!({
            "collection": self.collection,
            "pipeline": stages(&self.pipeline),
            "countPipeline": stages(&self.count_pipeline),
            "fetchResults": self.fetch_results,
        })
    }
}

#[derive(Debug, Clone)]
enum Hop {
    Field(String),
    Each,
}

/// A relation field reached from the document root.
struct Route<'t> {
    path: String,
    hops: Vec<Hop>,
    target: String,
    projection: &'t Projection,
}

enum Container<'a> {
    Fields(&'a Fields),
    Dynamic(&'a DynamicObjectField),
}

pub struct PipelineBuilder<'m> {
    model: &'m Model,
}

impl<'m> PipelineBuilder<'m> {
    pub fn new(model: &'m Model) -> Self {
        PipelineBuilder { model }
    }

    // ── Lookups ──────────────────────────────────────────────────

    /// Populate every relation with a nested selection in `tree`.
    pub fn lookups(&self, resource: &str, tree: &ProjectionTree) -> Result<Vec<Document>> {
        let mut stages = Vec::new();
        for route in self.routes(resource, tree, false)? {
            let Projection::Nested(subtree) = route.projection else {
                continue;
            };
            let temporary = format!("_lookup_{}", route.path.replace('.', "_"));

            let mut inner = self.lookups(&route.target, subtree)?;
            inner.push(doc! { "$project": inclusion(subtree) });
            stages.push(doc! {
                "$lookup": {
                    "from": route.target.as_str(),
                    "localField": route.path.as_str(),
                    "foreignField": "_id",
                    "as": temporary.as_str(),
                    "pipeline": inner,
                }
            });

            let through_arrays = route.hops.iter().any(|hop| matches!(hop, Hop::Each));
            let source = format!("${temporary}");
            let leaf = |expr: &str| -> Bson {
                if through_arrays {
                    Bson::Document(doc! {
                        "$let": {
                            "vars": { "idx": { "$indexOfArray": [format!("{source}._id"), expr] } },
                            "in": {
                                "$cond": [
                                    { "$eq": ["$$idx", -1] },
                                    Bson::Null,
                                    { "$arrayElemAt": [source.as_str(), "$$idx"] },
                                ]
                            }
                        }
                    })
                } else {
                    Bson::Document(doc! {
                        "$ifNull": [{ "$arrayElemAt": [source.as_str(), 0] }, Bson::Null]
                    })
                }
            };
            stages.push(doc! { "$addFields": rewrite(&route.hops, &leaf) });

            let mut drop = Document::new();
            drop.insert(temporary, 0);
            stages.push(doc! { "$project": drop });
        }
        Ok(stages)
    }

    fn routes<'t>(
        &self,
        resource: &str,
        tree: &'t ProjectionTree,
        cross_relations: bool,
    ) -> Result<Vec<Route<'t>>> {
        let fields = &self.model.resource(resource)?.fields;
        let mut routes = Vec::new();
        self.collect(Container::Fields(fields), tree, "", &[], cross_relations, &mut routes)?;
        Ok(routes)
    }

    fn collect<'t>(
        &self,
        container: Container<'_>,
        tree: &'t ProjectionTree,
        prefix: &str,
        hops: &[Hop],
        cross_relations: bool,
        routes: &mut Vec<Route<'t>>,
    ) -> Result<()> {
        for (name, projection) in tree {
            let path = join(prefix, name);
            let found = match &container {
                Container::Fields(fields) => fields.get(name),
                Container::Dynamic(dynamic) => dynamic.matching(name).map(|(_, schema)| schema),
            };
            let mut schema = found.ok_or_else(|| NestqlError::unknown(&path))?;

            let mut route = hops.to_vec();
            route.push(Hop::Field(name.clone()));
            while let FieldSchema::Array(array) = schema {
                route.push(Hop::Each);
                schema = &array.fields;
            }

            match (schema, projection) {
                (FieldSchema::Id(id), _) if id.relation.is_some() => {
                    let target = id.relation.clone().unwrap_or_default();
                    if cross_relations {
                        if let Projection::Nested(subtree) = projection {
                            let fields = &self.model.resource(&target)?.fields;
                            self.collect(
                                Container::Fields(fields),
                                subtree,
                                &path,
                                &route,
                                cross_relations,
                                routes,
                            )?;
                        }
                    }
                    routes.push(Route {
                        path,
                        hops: route,
                        target,
                        projection,
                    });
                }
                (FieldSchema::Object(object), Projection::Nested(subtree)) => self.collect(
                    Container::Fields(&object.fields),
                    subtree,
                    &path,
                    &route,
                    cross_relations,
                    routes,
                )?,
                (FieldSchema::DynamicObject(dynamic), Projection::Nested(subtree)) => self.collect(
                    Container::Dynamic(dynamic),
                    subtree,
                    &path,
                    &route,
                    cross_relations,
                    routes,
                )?,
                _ => {}
            }
        }
        Ok(())
    }

    // ── Matching and ordering ────────────────────────────────────

    /// One `$match` stage for the text query and the filters, or `None`
    /// when there is nothing to match. `joined` is the tree the preceding
    /// lookups populated.
    pub fn search(
        &self,
        resource: &str,
        joined: &ProjectionTree,
        query: Option<&(Vec<String>, Vec<String>)>,
        filters: &[(String, FilterValue)],
    ) -> Result<Option<Document>> {
        let mut conditions: Vec<Bson> = Vec::new();

        if let Some((on, tokens)) = query {
            let pattern = format!(
                "^{}.*$",
                tokens
                    .iter()
                    .map(|token| format!("(?=.*{})", regex::escape(token)))
                    .collect::<String>()
            );
            let mut alternatives = Vec::new();
            for field in on {
                let mut condition = Document::new();
                condition.insert(
                    self.match_key(resource, joined, field)?,
                    Bson::RegularExpression(bson::Regex {
                        pattern: pattern.clone(),
                        options: "i".to_string(),
                    }),
                );
                alternatives.push(condition);
            }
            conditions.push(Bson::Document(doc! { "$or": alternatives }));
        }

        for (path, value) in filters {
            let schema = field_at(self.model, resource, path)?;
            let bound = |date: &DateTime<Utc>| -> Bson {
                match schema {
                    FieldSchema::Date(_) => Bson::DateTime(date_to_bson(date)),
                    _ => Bson::String(format_date(date)),
                }
            };
            let test = match value {
                FilterValue::Equals(value) => to_bson(schema, value),
                FilterValue::OneOf(values) => {
                    let values: Vec<Bson> = values.iter().map(|v| to_bson(schema, v)).collect();
                    Bson::Document(doc! { "$in": values })
                }
                FilterValue::DateRange(start, end) => {
                    Bson::Document(doc! { "$gte": bound(start), "$lte": bound(end) })
                }
                FilterValue::Since(start) => Bson::Document(doc! { "$gte": bound(start) }),
            };
            let mut condition = Document::new();
            condition.insert(self.match_key(resource, joined, path)?, test);
            conditions.push(Bson::Document(condition));
        }

        if conditions.is_empty() {
            return Ok(None);
        }
        Ok(Some(doc! { "$match": { "$and": conditions } }))
    }

    /// Sort stage; empty input falls back to the configured ordering.
    pub fn sort(
        &self,
        resource: &str,
        joined: &ProjectionTree,
        sort_by: &[String],
        sort_order: &[SortOrder],
    ) -> Result<Document> {
        let mut keys = Document::new();
        for (field, order) in sort_pairs(&self.model.settings, sort_by, sort_order)? {
            keys.insert(self.match_key(resource, joined, &field)?, i8::from(order) as i32);
        }
        Ok(doc! { "$sort": keys })
    }

    pub fn paginate(offset: u64, limit: Option<u64>) -> Vec<Document> {
        let mut stages = vec![doc! { "$skip": offset as i64 }];
        if let Some(limit) = limit {
            stages.push(doc! { "$limit": limit.max(1) as i64 });
        }
        stages
    }

    /// A relation id that a lookup replaced with its document is matched
    /// through the document's `_id`.
    fn match_key(&self, resource: &str, joined: &ProjectionTree, path: &str) -> Result<String> {
        let schema = field_at(self.model, resource, path)?;
        let populated = matches!(node(joined, path), Some(Projection::Nested(_)));
        if schema.relation().is_some() && populated {
            Ok(format!("{path}._id"))
        } else {
            Ok(path.to_string())
        }
    }

    // ── Projection ───────────────────────────────────────────────

    /// Final shaping: relations the caller asked for as bare ids but that
    /// were populated for filtering go back to their id, then everything
    /// outside the projection is dropped.
    pub fn project(
        &self,
        resource: &str,
        projection: &ProjectionTree,
        joined: &ProjectionTree,
    ) -> Result<Vec<Document>> {
        let mut stages = Vec::new();
        for route in self.routes(resource, joined, true)? {
            if !matches!(route.projection, Projection::Nested(_)) {
                continue;
            }
            if !matches!(node(projection, &route.path), Some(Projection::Whole)) {
                continue;
            }
            let leaf = |expr: &str| -> Bson {
                Bson::Document(doc! { "$ifNull": [format!("{expr}._id"), Bson::Null] })
            };
            stages.push(doc! { "$addFields": rewrite(&route.hops, &leaf) });
        }
        stages.push(doc! { "$project": inclusion(projection) });
        Ok(stages)
    }
}

/// Builds both pipelines of a search request.
pub struct DocumentQueryBuilder<'m> {
    model: &'m Model,
}

impl<'m> DocumentQueryBuilder<'m> {
    pub fn new(model: &'m Model) -> Self {
        DocumentQueryBuilder { model }
    }

    pub fn build(&self, request: &SearchRequest) -> Result<DocumentQuery> {
        let search = ResolvedSearch::resolve(self.model, request)?;
        let joined = search.joined_tree();
        let builder = PipelineBuilder::new(self.model);
        let resource = search.resource.as_str();

        let mut pipeline = builder.lookups(resource, &joined)?;
        if let Some(stage) = builder.search(resource, &joined, search.query.as_ref(), &search.filters)? {
            pipeline.push(stage);
        }
        let (sort_by, sort_order): (Vec<String>, Vec<SortOrder>) = search.sort.iter().cloned().unzip();
        pipeline.push(builder.sort(resource, &joined, &sort_by, &sort_order)?);
        pipeline.extend(PipelineBuilder::paginate(search.offset, search.limit));
        pipeline.extend(builder.project(resource, &search.projection, &joined)?);

        let mut count_pipeline = builder.lookups(resource, &search.filter_tree)?;
        if let Some(stage) = builder.search(
            resource,
            &search.filter_tree,
            search.query.as_ref(),
            &search.filters,
        )? {
            count_pipeline.push(stage);
        }
        count_pipeline.push(doc! { "$count": "total" });

        log::debug!("Compiled {} pipeline with {} stages", resource, pipeline.len());
        Ok(DocumentQuery {
            collection: search.resource.clone(),
            pipeline,
            count_pipeline,
            fetch_results: search.limit != Some(0),
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// `$addFields` document that rewrites the value at the end of `hops`,
/// rebuilding the objects and arrays on the way down.
fn rewrite(hops: &[Hop], leaf: &dyn Fn(&str) -> Bson) -> Document {
    let mut fields = Document::new();
    if let Some((Hop::Field(root), rest)) = hops.split_first() {
        fields.insert(root.clone(), rebuild(rest, &format!("${root}"), 0, leaf));
    }
    fields
}

fn rebuild(hops: &[Hop], expr: &str, depth: usize, leaf: &dyn Fn(&str) -> Bson) -> Bson {
    match hops.split_first() {
        None => leaf(expr),
        Some((Hop::Each, rest)) => {
            let var = format!("el{depth}");
            let item = format!("$${var}");
            Bson::Document(doc! {
                "$map": {
                    "input": expr,
                    "as": var.as_str(),
                    "in": rebuild(rest, &item, depth + 1, leaf),
                }
            })
        }
        Some((Hop::Field(name), rest)) => {
            let mut merged = Document::new();
            merged.insert(name.clone(), rebuild(rest, &format!("{expr}.{name}"), depth, leaf));
            Bson::Document(doc! {
                "$cond": [
                    { "$eq": [{ "$type": expr }, "object"] },
                    { "$mergeObjects": [expr, merged] },
                    expr,
                ]
            })
        }
    }
}

/// Inclusion projection with one dotted key per selected leaf.
fn inclusion(tree: &ProjectionTree) -> Document {
    fn flatten(tree: &ProjectionTree, prefix: &str, out: &mut Document) {
        for (name, projection) in tree {
            let path = join(prefix, name);
            match projection {
                Projection::Whole => {
                    out.insert(path, 1);
                }
                Projection::Nested(subtree) => flatten(subtree, &path, out),
            }
        }
    }
    let mut out = Document::new();
    flatten(tree, "", &mut out);
    out
}

fn node<'t>(tree: &'t ProjectionTree, path: &str) -> Option<&'t Projection> {
    let mut current = tree;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let projection = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(projection);
        }
        current = projection.subtree()?;
    }
    None
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_model_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

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
      published: { type: date, index: true }
      author: { type: id, relation: users, index: true }
      comments:
        type: array
        fields:
          type: object
          fields:
            text: { type: string }
            by: { type: id, relation: users }
"#,
        )
        .unwrap()
    }

    fn request(value: serde_json::Value) -> SearchRequest {
        serde_json::from_value(value).unwrap()
    }

    fn operators(pipeline: &[Document]) -> Vec<String> {
        pipeline
            .iter()
            .filter_map(|stage| stage.keys().next().cloned())
            .collect()
    }

    #[test]
    fn test_plain_search_has_no_match_stage() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({ "resource": "posts", "fields": ["title"] })))
            .unwrap();
        assert_eq!(query.collection, "posts");
        assert_eq!(operators(&query.pipeline), vec!["$sort", "$skip", "$project"]);
        assert_eq!(query.pipeline[0], doc! { "$sort": { "_id": 1 } });
        assert_eq!(query.pipeline[2], doc! { "$project": { "_id": 1, "title": 1 } });
        assert_eq!(query.count_pipeline, vec![doc! { "$count": "total" }]);
        assert!(query.fetch_results);
    }

    #[test]
    fn test_relation_lookup_collapses_single_result() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({ "resource": "posts", "fields": ["author.name"] })))
            .unwrap();
        assert_eq!(
            query.pipeline[0],
            doc! {
                "$lookup": {
                    "from": "users",
                    "localField": "author",
                    "foreignField": "_id",
                    "as": "_lookup_author",
                    "pipeline": [{ "$project": { "_id": 1, "name": 1 } }],
                }
            }
        );
        assert_eq!(
            query.pipeline[1],
            doc! {
                "$addFields": {
                    "author": { "$ifNull": [{ "$arrayElemAt": ["$_lookup_author", 0] }, Bson::Null] }
                }
            }
        );
        assert_eq!(query.pipeline[2], doc! { "$project": { "_lookup_author": 0 } });
    }

    #[test]
    fn test_relation_inside_array_is_reassociated_by_id() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({ "resource": "posts", "fields": ["comments.by.name"] })))
            .unwrap();
        let lookup = query.pipeline[0].get_document("$lookup").unwrap();
        assert_eq!(lookup.get_str("localField").unwrap(), "comments.by");
        assert_eq!(lookup.get_str("as").unwrap(), "_lookup_comments_by");

        let rewrite = query.pipeline[1].get_document("$addFields").unwrap();
        let map = rewrite
            .get_document("comments")
            .unwrap()
            .get_document("$map")
            .unwrap();
        assert_eq!(map.get_str("input").unwrap(), "$comments");
        assert_eq!(map.get_str("as").unwrap(), "el0");
        let text = Bson::Document(rewrite.clone()).into_relaxed_extjson().to_string();
        assert!(text.contains("$indexOfArray"));
        assert!(text.contains("\"$_lookup_comments_by._id\""));
        assert!(text.contains("\"$$el0.by\""));
    }

    #[test]
    fn test_text_query_and_filters_share_one_match() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({
                "resource": "posts",
                "fields": ["title"],
                "query": { "on": ["title"], "text": "Hello, World" },
                "filters": {
                    "published": ["2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z"],
                    "author": "65f1c0a2b3d4e5f601234567"
                }
            })))
            .unwrap();
        let stage = query.pipeline[0].get_document("$match").unwrap();
        let conditions = stage.get_array("$and").unwrap();
        assert_eq!(conditions.len(), 3);

        let Bson::Document(text) = &conditions[0] else {
            panic!("expected a document");
        };
        let Bson::Document(regex) = &text.get_array("$or").unwrap()[0] else {
            panic!("expected a document");
        };
        match regex.get("title") {
            Some(Bson::RegularExpression(regex)) => {
                assert_eq!(regex.pattern, "^(?=.*hello)(?=.*world).*$");
                assert_eq!(regex.options, "i");
            }
            other => panic!("unexpected condition {other:?}"),
        }

        let Bson::Document(author) = &conditions[1] else {
            panic!("expected a document");
        };
        assert!(matches!(author.get("author"), Some(Bson::ObjectId(_))));

        let Bson::Document(range) = &conditions[2] else {
            panic!("expected a document");
        };
        let bounds = range.get_document("published").unwrap();
        assert!(matches!(bounds.get("$gte"), Some(Bson::DateTime(_))));
        assert!(matches!(bounds.get("$lte"), Some(Bson::DateTime(_))));
        assert_eq!(operators(&query.count_pipeline), vec!["$match", "$count"]);
    }

    #[test]
    fn test_relation_populated_for_filtering_is_reduced_to_id() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({
                "resource": "posts",
                "fields": ["author"],
                "filters": { "author.name": "Ada" }
            })))
            .unwrap();
        assert_eq!(
            operators(&query.pipeline),
            vec!["$lookup", "$addFields", "$project", "$match", "$sort", "$skip", "$addFields", "$project"]
        );
        assert_eq!(
            query.pipeline[6],
            doc! { "$addFields": { "author": { "$ifNull": ["$author._id", Bson::Null] } } }
        );
        assert_eq!(query.pipeline[7], doc! { "$project": { "_id": 1, "author": 1 } });
    }

    #[test]
    fn test_populated_relation_filters_on_its_id() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({
                "resource": "posts",
                "fields": ["author.name"],
                "filters": { "author": "user-1" }
            })))
            .unwrap();
        let stage = query.pipeline[3].get_document("$match").unwrap();
        let Bson::Document(condition) = &stage.get_array("$and").unwrap()[0] else {
            panic!("expected a document");
        };
        assert_eq!(condition.get_str("author._id").unwrap(), "user-1");

        let count = query.count_pipeline[0].get_document("$match").unwrap();
        let Bson::Document(condition) = &count.get_array("$and").unwrap()[0] else {
            panic!("expected a document");
        };
        assert_eq!(condition.get_str("author").unwrap(), "user-1");
    }

    #[test]
    fn test_zero_limit_skips_results() {
        let model = model();
        let query = DocumentQueryBuilder::new(&model)
            .build(&request(json!({ "resource": "posts", "fields": ["title"], "limit": 0, "offset": 5 })))
            .unwrap();
        assert!(!query.fetch_results);
        assert!(query.pipeline.contains(&doc! { "$skip": 5_i64 }));
        assert!(query.pipeline.contains(&doc! { "$limit": 1_i64 }));
    }

    #[test]
    fn test_sort_validation() {
        let model = model();
        let builder = PipelineBuilder::new(&model);
        let tree = ProjectionTree::new();
        assert!(matches!(
            builder.sort("posts", &tree, &["title".into()], &[]),
            Err(NestqlError::InvalidSorting(_))
        ));
        assert_eq!(
            builder
                .sort("posts", &tree, &["title".into(), "published".into()], &[SortOrder::Desc, SortOrder::Asc])
                .unwrap(),
            doc! { "$sort": { "title": -1, "published": 1 } }
        );
    }
}
