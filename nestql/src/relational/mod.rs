//! Normalized storage of nested resources: table layout and metadata, SQL
//! generation for searches, and the conversions between nested payloads and
//! flat rows.

pub mod assemble;
pub mod layout;
pub mod metadata;
pub mod plan;
pub mod sql;
pub mod structure;

pub use assemble::{assemble, SearchResults};
pub use layout::ColumnType;
pub use metadata::{Catalog, ResourceMetadata, StructureMetadata};
pub use plan::{AliasMap, QueryPlan};
pub use sql::{build_search_sql, SqlQuery, SqlValue};
pub use structure::{structure, Mode, Row, StructuredPayload};
