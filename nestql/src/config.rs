use crate::search::SortOrder;
use serde::{Deserialize, Serialize};

/// Engine settings, read from the `settings` section of the model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Objects nested deeper than this level get their own table in the
    /// relational backend. Root fields are level 0.
    pub inline_threshold: usize,
    /// Relation depth used when a request does not carry `maxDepth`.
    pub default_max_depth: usize,
    pub default_sort_by: Vec<String>,
    pub default_sort_order: Vec<SortOrder>,
    /// Target resource of `_createdBy` / `_updatedBy`.
    pub authors_resource: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            inline_threshold: 3,
            default_max_depth: 3,
            default_sort_by: vec!["_id".into()],
            default_sort_order: vec![SortOrder::Asc],
            authors_resource: "users".into(),
        }
    }
}
