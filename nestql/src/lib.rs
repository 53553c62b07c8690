pub mod config;
pub mod error;
pub mod schema;
pub mod projection;
pub mod search;
pub mod validation;
pub mod document;
pub mod relational;
pub mod backend;
pub mod integrity;
pub mod migration;
pub mod store;

pub use error::{NestqlError, Result};
pub use schema::{Model, ResourceSchema};
pub use search::{FilterValue, SearchRequest, SortOrder};
pub use store::{SharedStore, Store};
