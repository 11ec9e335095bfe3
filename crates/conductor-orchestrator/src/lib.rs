//! Agent orchestration core for Conductor.
//!
//! Agents are wrapped in [`AgentHandle`]s that enforce the lifecycle, run
//! serialization, timeouts and escalation. Handles are registered in an
//! [`AgentRegistry`] as main agents or sub-agents, and parents delegate work to
//! sub-agents through [`SubAgent`]. Free-form requests are classified by the
//! [`IntentClassifier`], routed by the [`AgentRouter`] and executed either
//! directly or as a DAG workflow by the [`WorkflowOrchestrator`]. The
//! [`Supervisor`] ties these together, and [`Runtime`] builds the whole thing
//! from a [`ConductorConfig`].

pub mod agent;
pub mod agents;
pub mod config;
pub mod delegation;
pub mod error;
pub mod escalation;
pub mod lifecycle;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod supervisor;
pub mod workflow;

pub use agent::{
    Agent, AgentConfig, AgentContext, AgentError, AgentResult, ApprovalLevel, RequestMetadata,
};
pub use agents::{EchoAgent, EscalationAgent, InventoryAgent};
pub use config::{AgentKind, ConductorConfig, ConfigSource, RosterEntry};
pub use delegation::{
    Delegate, DispatchQueue, ParentEvent, ParentInbox, ParentLink, Progress, SubAgent,
    TaskPayload, TaskResult, TaskStatus, execute_task,
};
pub use error::{ErrorKind, OrchestrationError, Result};
pub use escalation::{Escalator, Severity};
pub use lifecycle::{AgentHandle, AgentState, RetryPolicy};
pub use registry::{AgentRegistry, AgentRole, Registration, RegistryEntry};
pub use routing::{
    AgentRouter, DecisionState, Intent, IntentClassifier, RouteTarget, RoutingDecision,
    RoutingRequest,
};
pub use runtime::Runtime;
pub use supervisor::{Outcome, Supervisor, SupervisorResponse};
pub use workflow::{
    ExecutionStatus, StepTarget, WorkflowDefinition, WorkflowExecution, WorkflowOrchestrator,
    WorkflowStep,
};
