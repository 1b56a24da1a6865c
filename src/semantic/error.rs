//! Error types for the semantic layer.

use std::path::PathBuf;

/// Result type for semantic operations.
pub type SemanticResult<T> = Result<T, SemanticError>;

/// Errors raised while loading or validating the semantic model.
///
/// Any of these is fatal for the request that triggered it: caches are
/// never populated with a partially valid entity.
#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("entity '{entity}': descriptor not found at {path}")]
    DescriptorNotFound { entity: String, path: PathBuf },

    #[error("entity '{entity}': failed to read descriptor: {source}")]
    Read {
        entity: String,
        #[source]
        source: std::io::Error,
    },

    #[error("entity '{entity}': invalid descriptor: {source}")]
    Parse {
        entity: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("entity '{entity}': {message}")]
    Invariant { entity: String, message: String },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}': unknown field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("catalog descriptor not found at {0}")]
    CatalogNotFound(PathBuf),

    #[error("catalog: failed to read: {0}")]
    CatalogRead(#[source] std::io::Error),

    #[error("catalog: invalid document: {0}")]
    CatalogParse(#[source] serde_json::Error),

    #[error("model directory {path}: {source}")]
    ModelDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
