//! Error types for core runtime operations.
//!
//! All errors implement `std::error::Error` via the `thiserror` crate. The
//! engine converts these into wire results; [`CoreError::error_type`] yields
//! the taxonomy tag carried in `data.error_type`.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur inside the node/graph/workflow runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Identifier failed slug validation.
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    /// Identifier collides with an existing entity in the session.
    #[error("id '{id}' conflicts with existing {kind} in session '{session}'")]
    DuplicateId {
        id: String,
        kind: &'static str,
        session: String,
    },

    /// Node/graph/workflow/session lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A single execution is already in flight on this node.
    #[error("node '{0}' is busy")]
    NodeBusy(String),

    /// The node was stopped; it accepts no further operations.
    #[error("node '{0}' is stopped")]
    NodeStopped(String),

    /// The node hit a fatal fault; delete and recreate it.
    #[error("node '{id}' is in error state: {message} (delete and recreate the node)")]
    NodeError { id: String, message: String },

    /// An awaited response exceeded its bound.
    #[error("operation timed out after {0:.1}s")]
    Timeout(f64),

    /// Operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Graph structure is invalid (cycles, missing deps, conflicting config).
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    /// A step input template referenced a step id absent from `upstream`.
    #[error("Template references unknown step: {0}")]
    UnknownStepReference(String),

    /// Non-retryable HTTP error from an upstream LLM service.
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// A gate operation failed (no gate pending, invalid choice).
    #[error("{0}")]
    Gate(String),

    /// History writer initialization failed. Per-operation history writes
    /// never surface here; only creation may fail loudly.
    #[error("history error: {0}")]
    History(String),

    /// General execution failure.
    #[error("{0}")]
    Execution(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Taxonomy tag reported over the wire in `data.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            CoreError::InvalidName { .. } => "InvalidName",
            CoreError::DuplicateId { .. } => "DuplicateId",
            CoreError::NotFound { .. } => "NotFound",
            CoreError::NodeBusy(_) => "NodeBusy",
            CoreError::NodeStopped(_) => "NodeStopped",
            CoreError::NodeError { .. } => "NodeError",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Cancelled => "Cancelled",
            CoreError::GraphValidation(_) => "GraphValidation",
            CoreError::UnknownStepReference(_) => "UnknownStepReference",
            CoreError::Upstream { .. } => "UpstreamError",
            CoreError::Gate(_) => "InvalidParams",
            CoreError::History(_) => "HistoryError",
            CoreError::Execution(_) => "ExecutionError",
            CoreError::Serialization(_) => "SerializationError",
            CoreError::Io(_) => "IoError",
        }
    }

    /// Whether the error is a state-machine precondition failure.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            CoreError::NodeBusy(_) | CoreError::NodeStopped(_) | CoreError::NodeError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_tags() {
        let err = CoreError::NotFound {
            kind: "node",
            id: "missing".into(),
        };
        assert_eq!(err.error_type(), "NotFound");
        assert_eq!(err.to_string(), "node not found: missing");

        assert_eq!(CoreError::Cancelled.error_type(), "Cancelled");
        assert_eq!(
            CoreError::UnknownStepReference("pick".into()).error_type(),
            "UnknownStepReference"
        );
        assert!(CoreError::NodeBusy("n".into()).is_state_error());
        assert!(!CoreError::Cancelled.is_state_error());
    }

    #[test]
    fn node_error_mentions_recreate() {
        let err = CoreError::NodeError {
            id: "mcp-1".into(),
            message: "connection lost".into(),
        };
        assert!(err.to_string().contains("delete and recreate"));
    }
}
