//! Execution against a live database.

pub mod connection;
pub mod sqlite;

pub use connection::{ConnectionState, LazyConnection};
pub use sqlite::SqliteBackend;
