//! Request supervisor.
//!
//! The supervisor is the single entry point for free-form requests: it
//! classifies and routes each request, holds it back when the requester lacks
//! the required approval, and otherwise invokes the chosen agent (under that
//! agent's retry policy) or runs the chosen workflow.

use crate::agent::{AgentContext, AgentResult, ApprovalLevel};
use crate::error::{OrchestrationError, Result};
use crate::lifecycle::RetryPolicy;
use crate::registry::AgentRegistry;
use crate::routing::{AgentRouter, RouteTarget, RoutingDecision, RoutingRequest};
use crate::workflow::{ExecutionStatus, WorkflowExecution, WorkflowOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What the supervisor did with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// A single agent was invoked.
    Agent {
        /// Agent that handled the request.
        agent_id: String,
        /// Its final result, after retries.
        result: AgentResult<Value>,
    },
    /// A workflow was run.
    Workflow {
        /// The finished (or held) execution.
        execution: WorkflowExecution,
    },
    /// Nothing ran; the decision waits for approval.
    PendingApproval,
}

/// Decision and outcome for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorResponse {
    /// Routing decision.
    pub decision: RoutingDecision,
    /// What happened.
    pub outcome: Outcome,
}

impl SupervisorResponse {
    /// `true` if the agent or workflow completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        match &self.outcome {
            Outcome::Agent { result, .. } => result.success,
            Outcome::Workflow { execution } => execution.status == ExecutionStatus::Succeeded,
            Outcome::PendingApproval => false,
        }
    }
}

/// Entry point that turns requests into agent runs and workflow executions.
pub struct Supervisor {
    router: Arc<AgentRouter>,
    registry: Arc<AgentRegistry>,
    workflows: Option<Arc<WorkflowOrchestrator>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("router", &self.router)
            .field("workflows", &self.workflows.is_some())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor for agent-only routing.
    #[must_use]
    pub fn new(router: Arc<AgentRouter>, registry: Arc<AgentRegistry>) -> Self {
        Self { router, registry, workflows: None }
    }

    /// Enables workflow targets.
    #[must_use]
    pub fn with_workflows(mut self, workflows: Arc<WorkflowOrchestrator>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// The router in front of the supervisor.
    pub fn router(&self) -> &Arc<AgentRouter> {
        &self.router
    }

    /// Routes a request without executing it.
    ///
    /// # Errors
    /// Any routing error.
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingDecision> {
        self.router.route(request).await
    }

    /// Classifies, routes and, when approved, executes a request.
    ///
    /// # Arguments
    /// * `request` - The request and the approval level its requester holds
    ///
    /// # Returns
    /// The routing decision and what was done with it. Agent and step failures
    /// are reported in the outcome, not as errors.
    ///
    /// # Errors
    /// Routing errors, or `AgentNotFound` if the chosen agent disappeared
    /// before it could be invoked.
    pub async fn handle(&self, request: &RoutingRequest) -> Result<SupervisorResponse> {
        let decision = self.router.route(request).await?;
        if decision.is_pending() {
            info!(
                route = %decision.target,
                required = %decision.required_approval,
                granted = %decision.granted_approval,
                "Request pending approval"
            );
            return Ok(SupervisorResponse { decision, outcome: Outcome::PendingApproval });
        }

        let outcome = self.execute(&decision, request, decision.granted_approval).await?;
        Ok(SupervisorResponse { decision, outcome })
    }

    /// Executes a decision that was previously held for approval.
    ///
    /// # Arguments
    /// * `decision` - The pending decision
    /// * `request` - The original request
    /// * `approver` - Approval level of whoever signs off
    ///
    /// # Errors
    /// `ApprovalRequired` if `approver` is still below the required level.
    pub async fn execute_approved(
        &self,
        decision: RoutingDecision,
        request: &RoutingRequest,
        approver: ApprovalLevel,
    ) -> Result<SupervisorResponse> {
        if approver < decision.required_approval {
            warn!(
                route = %decision.target,
                required = %decision.required_approval,
                approver = %approver,
                "Approval insufficient"
            );
            return Err(OrchestrationError::ApprovalRequired {
                required: decision.required_approval,
                granted: approver,
            });
        }

        info!(route = %decision.target, approver = %approver, "Executing approved request");
        let outcome = self.execute(&decision, request, approver).await?;
        Ok(SupervisorResponse { decision, outcome })
    }

    async fn execute(
        &self,
        decision: &RoutingDecision,
        request: &RoutingRequest,
        granted: ApprovalLevel,
    ) -> Result<Outcome> {
        let input = request_input(decision, request);
        match &decision.target {
            RouteTarget::Agent(agent_id) => {
                let entry = self
                    .registry
                    .find_by_id(agent_id)
                    .await
                    .ok_or_else(|| OrchestrationError::AgentNotFound(agent_id.clone()))?;

                let mut context = AgentContext::new(input);
                if let Some(requested_by) = &request.requested_by {
                    context = context.with_requested_by(requested_by.clone());
                }
                let policy = RetryPolicy::from_config(&entry.handle.config());
                let result = policy.run(&entry.handle, context).await;
                Ok(Outcome::Agent { agent_id: agent_id.clone(), result })
            }
            RouteTarget::Workflow(workflow_id) => {
                let workflows = self.workflows.as_ref().ok_or_else(|| {
                    OrchestrationError::Configuration(format!(
                        "request routed to workflow '{}' but no orchestrator is attached",
                        workflow_id
                    ))
                })?;
                let execution = workflows.run(workflow_id, input, granted).await?;
                Ok(Outcome::Workflow { execution })
            }
        }
    }
}

fn request_input(decision: &RoutingDecision, request: &RoutingRequest) -> Value {
    json!({
        "request": request.input,
        "intent": decision.intent,
        "params": decision.intent.params,
        "data": request.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig};
    use crate::agents::{EchoAgent, EscalationAgent};
    use crate::escalation::Escalator;
    use crate::lifecycle::AgentHandle;
    use crate::registry::Registration;
    use crate::routing::{ClassifierConfig, IntentClassifier, RoutingConfig};
    use crate::workflow::{StepTarget, WorkflowCatalog, WorkflowDefinition, WorkflowStep};
    use conductor_abstraction::RecordingNotifier;

    async fn supervisor() -> Supervisor {
        let registry = Arc::new(AgentRegistry::new());
        let escalator = Arc::new(Escalator::new(Arc::new(RecordingNotifier::new())));

        let agents: Vec<(Arc<dyn Agent>, Registration)> = vec![
            (
                Arc::new(EscalationAgent::new(AgentConfig::new("escalation", "Desk"), escalator)),
                Registration::main(),
            ),
            (
                Arc::new(EchoAgent::new(AgentConfig::new("orders-1", "Orders"))),
                Registration::main().with_tag("orders"),
            ),
            (
                Arc::new(EchoAgent::new(AgentConfig::new("ledger-1", "Ledger"))),
                Registration::main().with_tag("ledger"),
            ),
            (
                Arc::new(EchoAgent::new(AgentConfig::new("reporting", "Reporting"))),
                Registration::main(),
            ),
        ];
        for (agent, registration) in agents {
            registry.spawn(Arc::new(AgentHandle::new(agent)), registration).await.unwrap();
        }

        let catalog = WorkflowCatalog::load([WorkflowDefinition::new(
            "month_end_close",
            "Close",
        )
        .with_approval_level(ApprovalLevel::Medium)
        .with_step(WorkflowStep::new("reconcile", StepTarget::Tag("ledger".into())))
        .with_step(
            WorkflowStep::new("report", StepTarget::Agent("reporting".into()))
                .depends_on("reconcile"),
        )])
        .unwrap();
        let workflows = Arc::new(WorkflowOrchestrator::new(catalog, Arc::clone(&registry)));
        let classifier = Arc::new(IntentClassifier::from_config(&ClassifierConfig::default()).unwrap());
        let router = AgentRouter::new(classifier, RoutingConfig::default(), Arc::clone(&registry))
            .unwrap()
            .with_workflows(Arc::clone(&workflows));

        Supervisor::new(Arc::new(router), registry).with_workflows(workflows)
    }

    #[tokio::test]
    async fn test_agent_request() {
        let supervisor = supervisor().await;
        let request = RoutingRequest::new("where is my order ORD-77? tracking says shipped");

        let response = supervisor.handle(&request).await.unwrap();
        assert!(response.is_success());
        match response.outcome {
            Outcome::Agent { agent_id, result } => {
                assert_eq!(agent_id, "orders-1");
                let output = result.data.unwrap();
                assert_eq!(output["echo"]["params"]["order_id"], "ORD-77");
            }
            other => panic!("expected agent outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unclear_request_goes_to_catch_all() {
        let supervisor = supervisor().await;
        let response = supervisor.handle(&RoutingRequest::new("hello")).await.unwrap();

        assert_eq!(response.decision.target, RouteTarget::Agent("escalation".into()));
        match response.outcome {
            Outcome::Agent { result, .. } => {
                assert_eq!(result.data.unwrap()["status"], "needs_clarification");
            }
            other => panic!("expected agent outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_workflow_pending_then_approved() {
        let supervisor = supervisor().await;
        let request = RoutingRequest::new("run the month end close and reconcile the ledger for 2024-03");

        let response = supervisor.handle(&request).await.unwrap();
        assert!(matches!(response.outcome, Outcome::PendingApproval));
        assert!(response.decision.is_pending());

        let decision = response.decision;
        let err = supervisor
            .execute_approved(decision.clone(), &request, ApprovalLevel::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ApprovalRequired { .. }));

        let response =
            supervisor.execute_approved(decision, &request, ApprovalLevel::High).await.unwrap();
        match response.outcome {
            Outcome::Workflow { execution } => {
                assert_eq!(execution.status, ExecutionStatus::Succeeded);
                assert_eq!(execution.input["params"]["period"], "2024-03");
                assert!(execution.output("report").is_some());
            }
            other => panic!("expected workflow outcome, got {:?}", other),
        }
    }
}
