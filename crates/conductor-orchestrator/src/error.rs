// Error types for orchestration

use crate::agent::ApprovalLevel;
use crate::lifecycle::AgentState;
use conductor_abstraction::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-initiated cancellation. Terminal, never retried.
    Cancelled,
    /// Pending approval. Not a failure.
    ApprovalRequired,
    /// Caller input malformed. Never retried.
    Validation,
    /// Network/storage hiccups and timeouts. Retryable.
    Transient,
    /// Bad configuration, surfaced at startup. Never retried.
    Configuration,
    /// Lifecycle contract violation. The agent is torn down.
    IllegalState,
}

impl ErrorKind {
    /// Whether a failure of this kind may be re-attempted.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "cancelled",
            Self::ApprovalRequired => "approval_required",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Configuration => "configuration",
            Self::IllegalState => "illegal_state",
        };
        f.write_str(name)
    }
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Invalid configuration (fatal, never retried)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Retryable failure
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed caller input
    #[error("Validation failure: {0}")]
    Validation(String),

    /// Action needs a higher approval level than the caller holds
    #[error("Approval required: action needs {required}, caller holds {granted}")]
    ApprovalRequired {
        /// Level the action requires
        required: ApprovalLevel,
        /// Level the caller was granted
        granted: ApprovalLevel,
    },

    /// Lifecycle contract violation
    #[error("Agent '{agent_id}' cannot {operation} while {state}")]
    IllegalState {
        /// Agent the call was made against
        agent_id: String,
        /// Operation that was attempted
        operation: &'static str,
        /// State the agent was in
        state: AgentState,
    },

    /// Agent ID already present in the registry
    #[error("Agent '{0}' is already registered")]
    DuplicateId(String),

    /// No live agent with this ID
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No workflow definition with this ID
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The agent did not finish within its timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled by the caller
    #[error("Cancelled by caller")]
    Cancelled,

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Classifies the error into the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Toml(_) | Self::WorkflowNotFound(_) => {
                ErrorKind::Configuration
            }
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) => ErrorKind::Transient,
            Self::Storage(e) if e.is_transient() => ErrorKind::Transient,
            Self::Validation(_)
            | Self::DuplicateId(_)
            | Self::AgentNotFound(_)
            | Self::Storage(_)
            | Self::Json(_) => ErrorKind::Validation,
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::IllegalState { .. } => ErrorKind::IllegalState,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable, machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Transient(_) => "transient_failure",
            Self::Validation(_) => "validation_failure",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::IllegalState { .. } => "illegal_state",
            Self::DuplicateId(_) => "duplicate_id",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Storage(StorageError::NotFound { .. }) => "record_not_found",
            Self::Storage(_) => "storage_error",
            Self::Json(_) => "invalid_json",
            Self::Toml(_) => "invalid_toml",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether the failure may be re-attempted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(OrchestrationError::Configuration("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(OrchestrationError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Transient);
        assert_eq!(OrchestrationError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            OrchestrationError::Storage(StorageError::Unavailable("down".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            OrchestrationError::Storage(StorageError::NotFound {
                collection: "inventory".into(),
                id: "SKU-1".into()
            })
            .kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(OrchestrationError::Transient("hiccup".into()).is_retryable());
        assert!(OrchestrationError::Timeout(Duration::from_millis(10)).is_retryable());
        assert!(!OrchestrationError::Validation("bad".into()).is_retryable());
        assert!(!OrchestrationError::Cancelled.is_retryable());
        assert!(!OrchestrationError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(OrchestrationError::DuplicateId("a".into()).code(), "duplicate_id");
        assert_eq!(
            OrchestrationError::ApprovalRequired {
                required: ApprovalLevel::High,
                granted: ApprovalLevel::Low
            }
            .code(),
            "approval_required"
        );
        assert_eq!(ErrorKind::IllegalState.to_string(), "illegal_state");
    }
}
