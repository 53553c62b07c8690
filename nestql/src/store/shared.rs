use super::Store;
use crate::error::{NestqlError, Result};
use crate::integrity::IntegrityReport;
use crate::relational::SearchResults;
use crate::search::SearchRequest;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// A [`Store`] for async callers. Every operation runs on tokio's blocking
/// pool, so SQLite work never holds up a runtime worker.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Store>,
}

impl SharedStore {
    pub fn new(store: Store) -> Self {
        SharedStore {
            inner: Arc::new(store),
        }
    }

    pub async fn open(model_path: PathBuf, db_path: PathBuf) -> Result<Self> {
        let store = blocking(move || Store::open(&model_path, &db_path)).await?;
        Ok(Self::new(store))
    }

    pub fn store(&self) -> &Store {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        blocking(move || f(&store)).await
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResults> {
        self.run(move |store| store.search(&request)).await
    }

    pub async fn view(&self, resource: String, id: String, fields: Vec<String>) -> Result<Value> {
        self.run(move |store| store.view(&resource, &id, &fields)).await
    }

    pub async fn create(&self, resource: String, payload: Value, author: Option<String>) -> Result<String> {
        self.run(move |store| store.create(&resource, &payload, author.as_deref()))
            .await
    }

    pub async fn update(
        &self,
        resource: String,
        id: String,
        payload: Value,
        author: Option<String>,
    ) -> Result<()> {
        self.run(move |store| store.update(&resource, &id, &payload, author.as_deref()))
            .await
    }

    pub async fn delete(&self, resource: String, id: String, author: Option<String>) -> Result<()> {
        self.run(move |store| store.delete(&resource, &id, author.as_deref()))
            .await
    }

    pub async fn check_integrity(&self, resource: String) -> Result<IntegrityReport> {
        self.run(move |store| store.check_integrity(&resource)).await
    }

    pub async fn check_all_integrity(&self) -> Result<Vec<IntegrityReport>> {
        self.run(|store| store.check_all_integrity()).await
    }
}

impl From<Store> for SharedStore {
    fn from(store: Store) -> Self {
        Self::new(store)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NestqlError::Other(format!("Blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MODEL: &str = r#"
resources:
  users:
    enable_deletion: false
    fields:
      name: { type: string, required: true, index: true }
"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_and_reads() {
        let store = SharedStore::new(Store::open_in_memory(MODEL).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create("users".into(), json!({ "name": format!("user{i}") }), None)
                    .await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }

        let results = store.search(SearchRequest::new("users")).await.unwrap();
        assert_eq!(results.total, 8);

        store.delete("users".into(), ids[0].clone(), None).await.unwrap();
        let err = store
            .view("users".into(), ids[0].clone(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NestqlError::NoResource { .. }));
        assert!(store.check_all_integrity().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.yaml");
        std::fs::write(&model_path, MODEL).unwrap();

        let store = SharedStore::open(model_path, dir.path().join("nestql.db"))
            .await
            .unwrap();
        let id = store
            .create("users".into(), json!({ "name": "Ada" }), None)
            .await
            .unwrap();
        let user = store.view("users".into(), id, vec!["name".into()]).await.unwrap();
        assert_eq!(user["name"], json!("Ada"));
    }
}
