//! Workflow execution state.

use crate::agent::{AgentError, ApprovalLevel};
use crate::delegation::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created; waiting to start or for approval.
    Pending,
    /// Steps are executing.
    Running,
    /// Every step succeeded.
    Succeeded,
    /// A step failed terminally.
    Failed,
    /// Cancelled at a step boundary.
    Cancelled,
}

impl ExecutionStatus {
    /// `true` for `Succeeded`, `Failed` and `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step ID.
    pub step_id: String,
    /// Agent the step ran on, when one was resolved.
    pub agent_id: Option<String>,
    /// Final status.
    pub status: TaskStatus,
    /// Number of invocations, retries included.
    pub attempts: u32,
    /// Failure detail.
    pub error: Option<AgentError>,
    /// Time spent in the final attempt.
    pub duration: Duration,
}

impl StepOutcome {
    /// A step that failed before any attempt was made.
    pub(crate) fn unstarted(step_id: &str, agent_id: Option<&str>, error: AgentError) -> Self {
        Self {
            step_id: step_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            status: TaskStatus::Failed,
            attempts: 0,
            error: Some(error),
            duration: Duration::ZERO,
        }
    }
}

/// The single consolidated error of a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Failing step.
    pub step_id: String,
    /// Its error code.
    pub code: String,
    /// Its error message.
    pub message: String,
    /// Outputs of the steps that completed before the failure.
    pub context: BTreeMap<String, Value>,
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed [{}]: {}", self.step_id, self.code, self.message)
    }
}

/// Marker of an execution held back for approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Level the workflow requires.
    pub required: ApprovalLevel,
    /// Level the caller holds.
    pub granted: ApprovalLevel,
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique execution ID.
    pub execution_id: String,
    /// Workflow being run.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Initial input.
    pub input: Value,
    /// Step ID to output, for every completed step.
    pub context: BTreeMap<String, Value>,
    /// Outcomes of the steps that were started, in completion order.
    pub steps: Vec<StepOutcome>,
    /// Most recently started step.
    pub current_step: Option<String>,
    /// When the execution left `Pending`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Consolidated failure, if `Failed`.
    pub failure: Option<WorkflowFailure>,
    /// Set while held back for approval.
    pub pending_approval: Option<PendingApproval>,
}

impl WorkflowExecution {
    /// Creates a `Pending` execution.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            input,
            context: BTreeMap::new(),
            steps: Vec::new(),
            current_step: None,
            started_at: None,
            ended_at: None,
            failure: None,
            pending_approval: None,
        }
    }

    /// Output of a completed step.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.context.get(step_id)
    }

    /// Outcome of a started step.
    pub fn step(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// `true` while held back for approval.
    #[must_use]
    pub fn is_pending_approval(&self) -> bool {
        self.status == ExecutionStatus::Pending && self.pending_approval.is_some()
    }

    /// Wall-clock duration, once terminal.
    pub fn elapsed(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        (end - start).to_std().ok()
    }

    pub(crate) fn hold_for_approval(&mut self, required: ApprovalLevel, granted: ApprovalLevel) {
        self.pending_approval = Some(PendingApproval { required, granted });
    }

    pub(crate) fn start(&mut self) {
        self.transition(ExecutionStatus::Running);
        self.pending_approval = None;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus) {
        self.transition(status);
        self.ended_at = Some(Utc::now());
    }

    fn transition(&mut self, to: ExecutionStatus) {
        debug!(
            execution_id = %self.execution_id,
            workflow_id = %self.workflow_id,
            from = %self.status,
            to = %to,
            "Execution status changed"
        );
        self.status = to;
    }
}
