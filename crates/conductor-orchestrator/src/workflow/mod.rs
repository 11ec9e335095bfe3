//! DAG-structured workflows of agent invocations.

pub mod definition;
pub mod engine;
pub mod execution;

pub use definition::{StepTarget, WorkflowCatalog, WorkflowDefinition, WorkflowStep};
pub use engine::{DEFAULT_MAX_CONCURRENCY, EXECUTIONS_COLLECTION, WorkflowOrchestrator};
pub use execution::{
    ExecutionStatus, PendingApproval, StepOutcome, WorkflowExecution, WorkflowFailure,
};
