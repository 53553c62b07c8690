pub mod shared;

pub use shared::SharedStore;

use crate::backend::SqliteBackend;
use crate::document::{DocumentQuery, DocumentQueryBuilder};
use crate::error::{NestqlError, Result};
use crate::integrity::{IntegrityChecker, IntegrityReport};
use crate::migration::{diff_catalogs, unsafe_migrations, SchemaMigration};
use crate::relational::{assemble, build_search_sql, structure, Catalog, Mode, SearchResults, SqlValue};
use crate::schema::{
    parse_model_str, Model, CREATED_AT, CREATED_BY, IS_DELETED, PRIMARY_KEY, UPDATED_AT, UPDATED_BY,
};
use crate::search::{format_date, parse_date, FilterValue, ResolvedSearch, SearchRequest};
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use std::path::Path;
use ulid::Ulid;

/// The main entry point: a model, its table catalog and the SQLite
/// database holding the resources.
pub struct Store {
    model: Model,
    model_yaml: String,
    catalog: Catalog,
    backend: SqliteBackend,
}

impl Store {
    /// Open a store from a model file and a database file. Tables are
    /// created or migrated to match the model.
    pub fn open(model_path: &Path, db_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(NestqlError::Schema(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }
        let model_yaml = std::fs::read_to_string(model_path)?;
        Self::with_backend(model_yaml, SqliteBackend::open(db_path))
    }

    /// Open a store over an in-memory database (for testing).
    pub fn open_in_memory(model_yaml: &str) -> Result<Self> {
        Self::with_backend(model_yaml.to_string(), SqliteBackend::open_in_memory())
    }

    fn with_backend(model_yaml: String, backend: SqliteBackend) -> Result<Self> {
        let model = parse_model_str(&model_yaml)?;
        let catalog = Catalog::new(&model)?;
        let store = Store {
            model,
            model_yaml,
            catalog,
            backend,
        };
        store.boot()?;
        Ok(store)
    }

    /// Bring the database in line with the model: create tables on first
    /// use, migrate when the recorded model differs.
    fn boot(&self) -> Result<()> {
        let current_hash = hash_model(&self.model_yaml);
        match self.backend.last_schema()? {
            None => {
                self.backend.apply_schema(&self.catalog)?;
                self.backend.record_schema(&current_hash, &self.model_yaml)?;
            }
            Some((hash, _)) if hash == current_hash => {
                self.backend.apply_schema(&self.catalog)?;
            }
            Some((_, previous_yaml)) => {
                let previous = Catalog::new(&parse_model_str(&previous_yaml)?)?;
                self.apply_migrations(&previous, &self.catalog, &self.model_yaml)?;
            }
        }
        Ok(())
    }

    /// Switch to a new model, applying the storage changes it implies.
    /// Fails without touching the database when any change is unsafe.
    pub fn migrate(&mut self, model_yaml: &str) -> Result<Vec<SchemaMigration>> {
        let model = parse_model_str(model_yaml)?;
        let catalog = Catalog::new(&model)?;
        let migrations = self.apply_migrations(&self.catalog, &catalog, model_yaml)?;
        self.model = model;
        self.catalog = catalog;
        self.model_yaml = model_yaml.to_string();
        Ok(migrations)
    }

    fn apply_migrations(
        &self,
        old: &Catalog,
        new: &Catalog,
        model_yaml: &str,
    ) -> Result<Vec<SchemaMigration>> {
        let migrations = diff_catalogs(old, new);
        let blocking = unsafe_migrations(&migrations);
        if !blocking.is_empty() {
            let reasons: Vec<String> = blocking.iter().map(|m| m.describe()).collect();
            return Err(NestqlError::Schema(format!(
                "Unsafe migrations: {}",
                reasons.join("; ")
            )));
        }

        let statements: Vec<String> = migrations.iter().flat_map(|m| m.statements(new)).collect();
        self.backend.execute_batch(&statements)?;
        for migration in &migrations {
            log::info!("Migration: {}", migration.describe());
            self.backend.record_migration(&migration.describe())?;
        }
        self.backend.record_schema(&hash_model(model_yaml), model_yaml)?;
        Ok(migrations)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    fn checker(&self) -> IntegrityChecker<'_> {
        IntegrityChecker::new(&self.model, &self.catalog, &self.backend)
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        let request = self.live_only(request)?;
        let search = ResolvedSearch::resolve(&self.model, &request)?;
        let query = build_search_sql(&self.model, &search)?;
        log::debug!("Search {}: {}", request.resource, query.sql);
        let rows = self.backend.execute(&query)?;
        Ok(assemble(&query.plan, &rows))
    }

    /// One resource by id.
    pub fn view(&self, resource: &str, id: &str, fields: &[String]) -> Result<Value> {
        let mut request = SearchRequest::new(resource);
        request.fields = fields.to_vec();
        request
            .filters
            .insert(PRIMARY_KEY.to_string(), FilterValue::Equals(id.into()));
        request.limit = Some(1);
        self.search(&request)?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| NestqlError::NoResource {
                collection: resource.to_string(),
                id: id.to_string(),
            })
    }

    /// Aggregation pipelines for the same request, for document stores.
    pub fn document_query(&self, request: &SearchRequest) -> Result<DocumentQuery> {
        DocumentQueryBuilder::new(&self.model).build(&self.live_only(request)?)
    }

    /// Soft-deleted rows are never returned.
    fn live_only(&self, request: &SearchRequest) -> Result<SearchRequest> {
        let mut request = request.clone();
        if self.model.resource(&request.resource)?.soft_deletes() {
            request
                .filters
                .insert(IS_DELETED.to_string(), FilterValue::Equals(Value::Bool(false)));
        }
        Ok(request)
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Create a resource and return its new id. `_updatedAt` stays null
    /// until the first modification.
    pub fn create(&self, resource: &str, payload: &Value, author: Option<&str>) -> Result<String> {
        let schema = self.model.resource(resource)?;
        let mut fields = user_fields(payload)?;
        if schema.soft_deletes() {
            fields.insert(IS_DELETED.to_string(), Value::Bool(false));
        }
        if schema.enable_timestamps {
            fields.insert(CREATED_AT.to_string(), Value::String(format_date(&Utc::now())));
        }
        if schema.enable_authors {
            fields.insert(CREATED_BY.to_string(), required_author(author, CREATED_BY)?);
        }
        let payload = Value::Object(fields);

        let checker = self.checker();
        checker.check_foreign_ids(&checker.collect_foreign_ids(resource, &payload)?)?;

        let id = Ulid::new().to_string();
        let metadata = self.catalog.resource(resource)?;
        let structured = structure(&self.model, metadata, &id, &payload, Mode::Create)?;
        self.backend.write(metadata, &structured, Mode::Create)?;
        log::debug!("Created {resource}/{id}");
        Ok(id)
    }

    /// Replace the fields present in `payload`.
    pub fn update(&self, resource: &str, id: &str, payload: &Value, author: Option<&str>) -> Result<()> {
        let schema = self.model.resource(resource)?;
        let mut fields = user_fields(payload)?;
        if schema.enable_timestamps {
            fields.insert(UPDATED_AT.to_string(), Value::String(self.modification_stamp(resource, id)?));
        } else if schema.soft_deletes() {
            self.view(resource, id, &[PRIMARY_KEY.to_string()])?;
        }
        if schema.enable_authors {
            fields.insert(UPDATED_BY.to_string(), required_author(author, UPDATED_BY)?);
        }
        let payload = Value::Object(fields);

        let checker = self.checker();
        checker.check_foreign_ids(&checker.collect_foreign_ids(resource, &payload)?)?;

        let metadata = self.catalog.resource(resource)?;
        let structured = structure(&self.model, metadata, id, &payload, Mode::Update)?;
        self.backend.write(metadata, &structured, Mode::Update)?;
        log::debug!("Updated {resource}/{id}");
        Ok(())
    }

    /// Delete a resource nothing references: soft-deleting resources are
    /// flagged, others removed with their sub-table rows.
    pub fn delete(&self, resource: &str, id: &str, author: Option<&str>) -> Result<()> {
        let schema = self.model.resource(resource)?;
        self.checker().check_references_to(resource, id)?;

        if schema.soft_deletes() {
            let mut stamps: Vec<(&str, SqlValue)> = Vec::new();
            if schema.enable_timestamps {
                stamps.push((UPDATED_AT, SqlValue::Text(self.modification_stamp(resource, id)?)));
            }
            if schema.enable_authors {
                if let Value::String(author) = required_author(author, UPDATED_BY)? {
                    stamps.push((UPDATED_BY, SqlValue::Text(author)));
                }
            }
            self.backend.soft_delete(resource, id, &stamps)?;
        } else {
            self.backend.delete_root(self.catalog.resource(resource)?, id)?;
        }
        log::debug!("Deleted {resource}/{id}");
        Ok(())
    }

    /// Current time, moved past the creation stamp when both fall in the
    /// same millisecond. Fails with `NoResource` for missing or hidden rows.
    fn modification_stamp(&self, resource: &str, id: &str) -> Result<String> {
        let current = self.view(resource, id, &[CREATED_AT.to_string()])?;
        let now = Utc::now();
        let stamp = match current[CREATED_AT].as_str().and_then(parse_date) {
            Some(created) if now.timestamp_millis() <= created.timestamp_millis() => {
                created + Duration::milliseconds(1)
            }
            _ => now,
        };
        Ok(format_date(&stamp))
    }

    // ── Integrity ────────────────────────────────────────────────

    pub fn check_integrity(&self, resource: &str) -> Result<IntegrityReport> {
        self.checker().check_integrity(resource)
    }

    pub fn check_all_integrity(&self) -> Result<Vec<IntegrityReport>> {
        self.checker().check_all_integrity()
    }
}

/// Caller-supplied fields; automatic `_`-prefixed fields belong to the store.
fn user_fields(payload: &Value) -> Result<Map<String, Value>> {
    let fields = payload
        .as_object()
        .ok_or_else(|| NestqlError::invalid("payload", "expected an object"))?;
    if let Some(key) = fields.keys().find(|k| k.starts_with('_')) {
        return Err(NestqlError::invalid(key.as_str(), "automatic fields are set by the store"));
    }
    Ok(fields.clone())
}

fn required_author(author: Option<&str>, field: &str) -> Result<Value> {
    author
        .map(|a| Value::String(a.to_string()))
        .ok_or_else(|| NestqlError::MissingField {
            path: field.to_string(),
        })
}

/// Stable fingerprint of a model source.
pub fn hash_model(yaml: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    yaml.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MODEL: &str = r#"
resources:
  users:
    enable_deletion: false
    enable_timestamps: true
    fields:
      name: { type: string, required: true, index: true }
  posts:
    enable_timestamps: true
    fields:
      title: { type: string, required: true, index: true }
      author: { type: id, relation: users, index: true }
      tags: { type: array, fields: { type: string } }
      profile:
        type: object
        fields:
          city: { type: string }
"#;

    fn request(value: Value) -> SearchRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_create_then_view() {
        let store = Store::open_in_memory(MODEL).unwrap();
        let user = store.create("users", &json!({ "name": "Ada" }), None).unwrap();
        let post = store
            .create(
                "posts",
                &json!({ "title": "Hello", "author": user, "tags": ["a", "b"], "profile": { "city": "Paris" } }),
                None,
            )
            .unwrap();

        let item = store.view("posts", &post, &[]).unwrap();
        assert_eq!(item["_id"], json!(post));
        assert_eq!(item["title"], json!("Hello"));
        assert_eq!(item["tags"], json!(["a", "b"]));
        assert_eq!(item["profile"], json!({ "city": "Paris" }));
        assert!(item["_createdAt"].is_string());
        assert_eq!(item["_updatedAt"], Value::Null);

        let item = store
            .view("posts", &post, &["title".to_string(), "author.name".to_string()])
            .unwrap();
        assert_eq!(
            item,
            json!({ "_id": post, "title": "Hello", "author": { "_id": user, "name": "Ada" } })
        );
    }

    #[test]
    fn test_search_counts_roots() {
        let store = Store::open_in_memory(MODEL).unwrap();
        for title in ["a", "b", "c"] {
            store
                .create("posts", &json!({ "title": title, "tags": ["x", "y", "z"] }), None)
                .unwrap();
        }
        let results = store
            .search(&request(json!({
                "resource": "posts",
                "fields": ["title", "tags"],
                "sortBy": ["title"],
                "sortOrder": [-1],
                "limit": 2
            })))
            .unwrap();
        assert_eq!(results.total, 3);
        let titles: Vec<&Value> = results.items.iter().map(|item| &item["title"]).collect();
        assert_eq!(titles, vec![&json!("c"), &json!("b")]);
        assert_eq!(results.items[0]["tags"], json!(["x", "y", "z"]));
    }

    #[test]
    fn test_create_checks_relations_and_automatic_fields() {
        let store = Store::open_in_memory(MODEL).unwrap();
        assert!(matches!(
            store.create("posts", &json!({ "title": "t", "author": "nobody" }), None),
            Err(NestqlError::NoResource { collection, id }) if collection == "users" && id == "nobody"
        ));
        assert!(matches!(
            store.create("posts", &json!({ "title": "t", "_createdAt": "2024-01-01T00:00:00Z" }), None),
            Err(NestqlError::InvalidField { .. })
        ));
        assert!(matches!(
            store.create("posts", &json!({ "tags": [] }), None),
            Err(NestqlError::MissingField { path }) if path == "title"
        ));
        let results = store.search(&SearchRequest::new("posts")).unwrap();
        assert_eq!(results.total, 0);
    }

    #[test]
    fn test_update_replaces_present_fields() {
        let store = Store::open_in_memory(MODEL).unwrap();
        let post = store
            .create("posts", &json!({ "title": "t", "tags": ["a", "b"] }), None)
            .unwrap();
        store.update("posts", &post, &json!({ "tags": ["c"] }), None).unwrap();

        let item = store.view("posts", &post, &[]).unwrap();
        assert_eq!(item["title"], json!("t"));
        assert_eq!(item["tags"], json!(["c"]));
        assert!(item["_updatedAt"].as_str() > item["_createdAt"].as_str());

        assert!(matches!(
            store.update("posts", "missing", &json!({ "title": "x" }), None),
            Err(NestqlError::NoResource { .. })
        ));
    }

    #[test]
    fn test_authors_without_timestamps() {
        let store = Store::open_in_memory(
            r#"
resources:
  users:
    fields:
      name: { type: string }
  notes:
    enable_authors: true
    enable_deletion: false
    fields:
      body: { type: string }
"#,
        )
        .unwrap();
        let ada = store.create("users", &json!({ "name": "Ada" }), None).unwrap();
        let bob = store.create("users", &json!({ "name": "Bob" }), None).unwrap();

        assert!(matches!(
            store.create("notes", &json!({ "body": "x" }), None),
            Err(NestqlError::MissingField { path }) if path == "_createdBy"
        ));
        let note = store.create("notes", &json!({ "body": "x" }), Some(&ada)).unwrap();
        let item = store.view("notes", &note, &[]).unwrap();
        assert_eq!(item["_createdBy"], json!(ada));
        assert_eq!(item["_updatedBy"], Value::Null);

        store
            .update("notes", &note, &json!({ "body": "y" }), Some(&bob))
            .unwrap();
        let item = store.view("notes", &note, &[]).unwrap();
        assert_eq!(item["_createdBy"], json!(ada));
        assert_eq!(item["_updatedBy"], json!(bob));
    }

    #[test]
    fn test_delete_respects_references() {
        let store = Store::open_in_memory(MODEL).unwrap();
        let user = store.create("users", &json!({ "name": "Ada" }), None).unwrap();
        let post = store
            .create("posts", &json!({ "title": "t", "author": user }), None)
            .unwrap();

        assert!(matches!(
            store.delete("users", &user, None),
            Err(NestqlError::ResourceReferenced { collection, .. }) if collection == "posts"
        ));
        store.delete("posts", &post, None).unwrap();
        store.delete("users", &user, None).unwrap();

        assert!(matches!(
            store.view("users", &user, &[]),
            Err(NestqlError::NoResource { .. })
        ));
        assert_eq!(store.search(&SearchRequest::new("users")).unwrap().total, 0);
        assert!(matches!(
            store.create("posts", &json!({ "title": "t", "author": user }), None),
            Err(NestqlError::NoResource { .. })
        ));
        assert!(store.check_all_integrity().is_ok());
    }

    #[test]
    fn test_document_query_hides_soft_deleted() {
        let store = Store::open_in_memory(MODEL).unwrap();
        let query = store.document_query(&SearchRequest::new("users")).unwrap();
        let text = serde_json::to_string(&query.to_json()).unwrap();
        assert!(text.contains("\"_isDeleted\":false"));
    }

    #[test]
    fn test_migrate() {
        let mut store = Store::open_in_memory(MODEL).unwrap();
        let extended = MODEL.replace(
            "      tags:",
            "      summary: { type: string }\n      tags:",
        );
        let migrations = store.migrate(&extended).unwrap();
        assert_eq!(migrations.len(), 1);
        let post = store
            .create("posts", &json!({ "title": "t", "summary": "s" }), None)
            .unwrap();
        assert_eq!(store.view("posts", &post, &["summary".to_string()]).unwrap()["summary"], json!("s"));

        let retyped = extended.replace("summary: { type: string }", "summary: { type: integer }");
        assert!(matches!(store.migrate(&retyped), Err(NestqlError::Schema(_))));
        assert!(store.model().resource("posts").unwrap().field("summary").is_some());
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.yaml");
        let db_path = dir.path().join("nestql.db");
        std::fs::write(&model_path, MODEL).unwrap();

        let id = {
            let store = Store::open(&model_path, &db_path).unwrap();
            store.create("users", &json!({ "name": "Ada" }), None).unwrap()
        };

        std::fs::write(&model_path, MODEL.replace("      name:", "      bio: { type: string }\n      name:")).unwrap();
        let store = Store::open(&model_path, &db_path).unwrap();
        let user = store.view("users", &id, &[]).unwrap();
        assert_eq!(user["name"], json!("Ada"));
        assert_eq!(user["bio"], Value::Null);
        let (hash, _) = store.backend().last_schema().unwrap().unwrap();
        assert_eq!(hash, hash_model(&std::fs::read_to_string(&model_path).unwrap()));
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Store::open(&dir.path().join("model.yaml"), &dir.path().join("db")),
            Err(NestqlError::Schema(_))
        ));
    }
}
