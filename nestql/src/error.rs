use thiserror::Error;

#[derive(Error, Debug)]
pub enum NestqlError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Unknown field: {path}")]
    UnknownField { path: String },

    #[error("Missing required field: {path}")]
    MissingField { path: String },

    #[error("Invalid field '{path}': {reason}")]
    InvalidField { path: String, reason: String },

    #[error("Maximum depth {max_depth} exceeded at '{path}'")]
    MaximumDepthExceeded { path: String, max_depth: usize },

    #[error("Field '{path}' is neither unique nor indexed")]
    UnindexedField { path: String },

    #[error("Invalid sorting: {0}")]
    InvalidSorting(String),

    #[error("Duplicate resource in {collection}: {detail}")]
    DuplicateResource { collection: String, detail: String },

    #[error("Resource {id} is referenced by {collection}")]
    ResourceReferenced { collection: String, id: String },

    #[error("No resource with id '{id}' in {collection}")]
    NoResource { collection: String, id: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Integrity checks failed for: {}", .resources.join(", "))]
    FailedIntegrityChecks { resources: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl NestqlError {
    pub(crate) fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        NestqlError::InvalidField {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown(path: impl Into<String>) -> Self {
        NestqlError::UnknownField { path: path.into() }
    }

    /// Only connection failures may be retried by the caller; every other
    /// error is a deterministic rejection of the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NestqlError::ConnectionFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, NestqlError>;
