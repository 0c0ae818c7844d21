//! Error taxonomy shared by every docgraph component.
//!
//! Each variant names the entity (path, doc_id, node_id, model_id, or query
//! token) and, where it matters, the [`Stage`] that failed. `Unsupported` is
//! a routing signal from the accelerated vector index, not a hard failure.

use std::fmt;

use thiserror::Error;

/// Pipeline stage responsible for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Ingest,
    Query,
    Embed,
    Schema,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Parse => "parse",
            Stage::Ingest => "ingest",
            Stage::Query => "query",
            Stage::Embed => "embed",
            Stage::Schema => "schema",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    /// Bad source path or unusable input bytes.
    #[error("input error for '{path}': {reason}")]
    Input { path: String, reason: String },

    /// The whole document was rejected by the shredder.
    #[error("parse error in '{path}': {reason}")]
    Parse { path: String, reason: String },

    /// Malformed full-text query.
    #[error("query syntax error at token '{token}': {reason}")]
    QuerySyntax { token: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch for model '{model_id}': expected {expected}, got {actual}")]
    DimensionMismatch {
        model_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transaction or I/O failure. The transaction has been rolled back.
    #[error("storage error during {stage} of '{entity}': {message}")]
    Storage {
        stage: Stage,
        entity: String,
        message: String,
    },
}

impl GraphError {
    pub fn storage(stage: Stage, entity: impl Into<String>, err: impl fmt::Display) -> Self {
        GraphError::Storage {
            stage,
            entity: entity.into(),
            message: err.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        GraphError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, GraphError::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_names_stage_and_entity() {
        let err = GraphError::storage(Stage::Ingest, "notes/a.md", "disk full");
        let msg = err.to_string();
        assert!(msg.contains("ingest"));
        assert!(msg.contains("notes/a.md"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_query_syntax_names_token() {
        let err = GraphError::QuerySyntax {
            token: "title:".into(),
            reason: "column filters are not supported".into(),
        };
        assert!(err.to_string().contains("'title:'"));
    }

    #[test]
    fn test_unsupported_is_routing_signal() {
        assert!(GraphError::Unsupported("no index".into()).is_unsupported());
        assert!(!GraphError::InvalidArgument("k".into()).is_unsupported());
    }
}
