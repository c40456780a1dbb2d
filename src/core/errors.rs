use thiserror::Error;

use crate::flow::status::NodeStatus;

/// Unified error type for the maestro engine
#[derive(Debug, Error)]
pub enum MaestroError {
    /// Workflow definition or graph construction errors
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A status transition was requested on a node not in its required source status
    #[error("Invalid transition for node '{node}': cannot move from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// No node is runnable, nothing is in flight, and execution is not complete
    #[error("Execution deadlocked: no runnable nodes remain (blocked: {remaining:?})")]
    Deadlock { remaining: Vec<String> },

    /// A node's output was written more than once
    #[error("Output for node '{0}' has already been recorded")]
    DuplicateOutput(String),

    /// A node id was referenced that does not exist in the graph
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Definition parse error: {0}")]
    Definition(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MaestroError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_transition<S: Into<String>>(node: S, from: NodeStatus, to: NodeStatus) -> Self {
        Self::InvalidTransition {
            node: node.into(),
            from,
            to,
        }
    }

    pub fn deadlock(remaining: Vec<String>) -> Self {
        Self::Deadlock { remaining }
    }

    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        Self::NodeNotFound(id.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidTransition { .. } => "transition",
            Self::Deadlock { .. } => "deadlock",
            Self::DuplicateOutput(_) => "context",
            Self::NodeNotFound(_) => "graph",
            Self::Serialization(_) => "serialization",
            Self::Definition(_) => "definition",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// Deadlocks and invalid transitions indicate a malformed graph or an
    /// engine defect and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Deadlock { .. } | Self::InvalidTransition { .. } | Self::Internal(_)
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = MaestroError::validation("bad graph");
        assert_eq!(err.category(), "validation");
        assert!(!err.is_fatal());

        let err = MaestroError::deadlock(vec!["n1".to_string()]);
        assert_eq!(err.category(), "deadlock");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err =
            MaestroError::invalid_transition("n1", NodeStatus::Completed, NodeStatus::Executing);
        let text = err.to_string();
        assert!(text.contains("n1"));
        assert!(text.contains("completed"));
        assert!(text.contains("executing"));
    }
}
