use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatonError {
    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid handoff config: {}", .0.join("; "))]
    ConfigValidation(Vec<String>),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Handoff errors
    #[error("Handoff not found: {0}")]
    HandoffNotFound(String),

    #[error("Handoff {handoff_id} is addressed to {expected}, not {actual}")]
    HandoffMisdirected {
        handoff_id: String,
        expected: String,
        actual: String,
    },

    #[error("Handoff {0} passed its deadline before completion")]
    HandoffExpired(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Context serialization failed: {0}")]
    Serialization(String),

    #[error("Circuit breaker open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("Handoff exhausted after {attempts} attempts: {last_error}")]
    HandoffExhausted { attempts: u32, last_error: String },

    // Consensus errors
    #[error("Voting session not found: {0}")]
    SessionNotFound(String),

    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Workflow errors
    #[error("Node '{node_id}' not found in graph (path so far: {path:?})")]
    NodeNotFound { node_id: String, path: Vec<String> },

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Workflow exceeded {limit} iterations (path: {path:?})")]
    WorkflowExceededIterations { limit: usize, path: Vec<String> },

    #[error("Node processing failed: {node_id}: {message}")]
    NodeProcessing { node_id: String, message: String },

    // Collaborator errors
    #[error("Handoff evaluation failed: {0}")]
    Evaluation(String),

    #[error("Capability routing failed: {0}")]
    Routing(String),

    #[error("External agent failed: {0}")]
    ExternalAgent(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BatonError {
    /// Coarse category used in failure events and health reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::ConfigValidation(_) | Self::Config(_) => "validation",
            Self::ConfigNotFound(_)
            | Self::HandoffNotFound(_)
            | Self::SessionNotFound(_)
            | Self::AgentNotRegistered(_)
            | Self::NodeNotFound { .. }
            | Self::EdgeNotFound(_) => "not_found",
            Self::HandoffMisdirected { .. } | Self::Conflict(_) => "conflict",
            Self::HandoffExpired(_) => "expired",
            Self::Compression(_) | Self::Serialization(_) | Self::Json(_) => "compression",
            Self::WorkflowExceededIterations { .. } => "workflow_bounds_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::HandoffExhausted { .. } => "handoff_exhausted",
            Self::NodeProcessing { .. } => "node_processing",
            Self::Evaluation(_) | Self::Routing(_) | Self::ExternalAgent(_) => "collaborator",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, BatonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_joins_issues() {
        let err = BatonError::ConfigValidation(vec![
            "max_retry_attempts must be at least 1".into(),
            "confidence_threshold must be within [0, 1]".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("max_retry_attempts"));
        assert!(msg.contains("; confidence_threshold"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(BatonError::HandoffNotFound("h".into()).kind(), "not_found");
        assert_eq!(BatonError::Conflict("dup".into()).kind(), "conflict");
        assert_eq!(
            BatonError::WorkflowExceededIterations {
                limit: 100,
                path: vec![]
            }
            .kind(),
            "workflow_bounds_exceeded"
        );
        assert_eq!(BatonError::CircuitOpen { retry_in_ms: 5 }.kind(), "circuit_open");
    }
}
