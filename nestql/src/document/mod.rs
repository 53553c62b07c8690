//! Aggregation pipelines for document stores.

pub mod pipeline;
pub mod value;

pub use pipeline::{DocumentQuery, DocumentQueryBuilder, PipelineBuilder};
pub use value::{document_to_json, from_bson, to_bson};
