//! Workflow orchestrator.
//!
//! Drives executions `Pending → Running → {Succeeded | Failed | Cancelled}`.
//! Steps start as soon as their dependencies have produced output, up to
//! `max_concurrency` at a time. Each step is a delegated task retried under the
//! step's own budget. A terminal step failure or a cancellation stops new steps
//! from starting; steps already in flight are allowed to finish. Step failures
//! are escalated once, as the workflow's consolidated failure.

use super::definition::{StepTarget, WorkflowCatalog, WorkflowDefinition, WorkflowStep};
use super::execution::{ExecutionStatus, StepOutcome, WorkflowExecution, WorkflowFailure};
use crate::agent::{AgentError, AgentResult, ApprovalLevel};
use crate::delegation::{TaskPayload, TaskResult, TaskStatus, execute_task_unescalated};
use crate::error::{ErrorKind, OrchestrationError, Result};
use crate::escalation::Escalator;
use crate::lifecycle::{AgentHandle, RetryPolicy};
use crate::registry::{AgentRegistry, load_key};
use conductor_abstraction::Storage;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collection finished executions are archived to.
pub const EXECUTIONS_COLLECTION: &str = "workflow_executions";

/// Default number of steps running at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Why an execution stopped starting new steps.
enum Halt {
    Failed(WorkflowFailure),
    Cancelled,
}

/// Workflow orchestrator.
pub struct WorkflowOrchestrator {
    catalog: RwLock<WorkflowCatalog>,
    registry: Arc<AgentRegistry>,
    max_concurrency: usize,
    default_retry: RetryPolicy,
    escalator: Option<Arc<Escalator>>,
    storage: Option<Arc<dyn Storage>>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("workflows", &self.workflow_ids())
            .field("max_concurrency", &self.max_concurrency)
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator over `catalog`, resolving agents in `registry`.
    #[must_use]
    pub fn new(catalog: WorkflowCatalog, registry: Arc<AgentRegistry>) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            registry,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            escalator: None,
            storage: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Limits how many steps run at once (at least one).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Retry policy for steps that declare none.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Escalates consolidated failures.
    #[must_use]
    pub fn with_escalator(mut self, escalator: Arc<Escalator>) -> Self {
        self.escalator = Some(escalator);
        self
    }

    /// Archives finished executions.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates and adds a workflow.
    ///
    /// # Errors
    /// `ConfigurationError` if the definition is invalid or its ID is taken.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner).insert(definition)
    }

    /// Looks up a workflow definition.
    pub fn definition(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner).get(workflow_id).cloned()
    }

    /// Known workflow IDs.
    pub fn workflow_ids(&self) -> Vec<String> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner).ids()
    }

    /// IDs of executions currently running.
    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<_> =
            self.active.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Requests cancellation of a running execution.
    ///
    /// Takes effect at the next step boundary.
    ///
    /// # Returns
    /// `true` if the execution was running.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.active.lock().unwrap_or_else(PoisonError::into_inner).get(execution_id) {
            Some(token) => {
                info!(execution_id = %execution_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Approval needed to run a workflow.
    ///
    /// The highest of the definition's own level and the level of every agent a
    /// step could currently run on.
    ///
    /// # Errors
    /// `WorkflowNotFound` for an unknown ID.
    pub async fn required_approval(&self, workflow_id: &str) -> Result<ApprovalLevel> {
        let definition = self
            .definition(workflow_id)
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(self.required_for(&definition).await)
    }

    async fn required_for(&self, definition: &WorkflowDefinition) -> ApprovalLevel {
        let mut required = definition.approval_level;
        for step in &definition.steps {
            let candidates = match &step.target {
                StepTarget::Agent(id) => self.registry.find_by_id(id).await.into_iter().collect(),
                StepTarget::Tag(tag) => self.registry.find_by_tag(tag).await,
            };
            for entry in candidates {
                required = required.max(entry.handle.config().approval_level);
            }
        }
        required
    }

    /// Runs a workflow to completion.
    ///
    /// # Errors
    /// Only `WorkflowNotFound`. Every other outcome, including step failures
    /// and a pending approval, is reported in the returned execution.
    pub async fn run(
        &self,
        workflow_id: &str,
        input: Value,
        granted: ApprovalLevel,
    ) -> Result<WorkflowExecution> {
        self.run_with_cancellation(workflow_id, input, granted, CancellationToken::new()).await
    }

    /// Runs a workflow, stopping at the next step boundary once `cancel` fires.
    ///
    /// # Errors
    /// Only `WorkflowNotFound`, as for [`WorkflowOrchestrator::run`].
    pub async fn run_with_cancellation(
        &self,
        workflow_id: &str,
        input: Value,
        granted: ApprovalLevel,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution> {
        let definition = self
            .definition(workflow_id)
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(workflow_id.to_string()))?;
        let mut execution = WorkflowExecution::new(workflow_id, input);

        let required = self.required_for(&definition).await;
        if required > granted {
            info!(
                execution_id = %execution.execution_id,
                workflow_id = %workflow_id,
                required = %required,
                granted = %granted,
                "Workflow held for approval"
            );
            execution.hold_for_approval(required, granted);
            return Ok(execution);
        }

        let token = cancel.child_token();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution.execution_id.clone(), token.clone());

        info!(
            execution_id = %execution.execution_id,
            workflow_id = %workflow_id,
            steps = definition.steps.len(),
            "Workflow started"
        );
        execution.start();
        let halt = self.drive(&definition, &mut execution, granted, &token).await;

        self.active.lock().unwrap_or_else(PoisonError::into_inner).remove(&execution.execution_id);

        match halt {
            None => {
                execution.finish(ExecutionStatus::Succeeded);
                info!(execution_id = %execution.execution_id, workflow_id = %workflow_id, "Workflow succeeded");
            }
            Some(Halt::Cancelled) => {
                execution.finish(ExecutionStatus::Cancelled);
                info!(execution_id = %execution.execution_id, workflow_id = %workflow_id, "Workflow cancelled");
            }
            Some(Halt::Failed(failure)) => {
                error!(
                    execution_id = %execution.execution_id,
                    workflow_id = %workflow_id,
                    step_id = %failure.step_id,
                    code = %failure.code,
                    "Workflow failed: {}",
                    failure.message
                );
                execution.failure = Some(failure);
                execution.finish(ExecutionStatus::Failed);
                self.escalate(&definition, &execution).await;
            }
        }

        self.archive(&execution).await;
        Ok(execution)
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        granted: ApprovalLevel,
        token: &CancellationToken,
    ) -> Option<Halt> {
        // Validated on load; an error here means the catalog was bypassed.
        let order = match definition.execution_order() {
            Ok(order) => order,
            Err(e) => {
                return Some(Halt::Failed(consolidate(execution, &definition.id, &AgentError::from(&e))));
            }
        };
        let mut waiting: Vec<&WorkflowStep> =
            order.iter().filter_map(|id| definition.step(id)).collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut running: JoinSet<(String, Option<String>, TaskResult<Value>)> = JoinSet::new();
        let mut halt: Option<Halt> = None;

        loop {
            while halt.is_none() && running.len() < self.max_concurrency {
                let Some(pos) = waiting
                    .iter()
                    .position(|s| s.depends_on.iter().all(|dep| completed.contains(dep)))
                else {
                    break;
                };
                if token.is_cancelled() {
                    halt = Some(Halt::Cancelled);
                    break;
                }
                let step = waiting.remove(pos);

                let Some(handle) = self.resolve(&step.target, granted).await else {
                    let error = AgentError::from(OrchestrationError::AgentNotFound(step.target.to_string()));
                    execution.steps.push(StepOutcome::unstarted(&step.id, None, error.clone()));
                    halt = Some(Halt::Failed(consolidate(execution, &step.id, &error)));
                    break;
                };

                // The agent set can change after the up-front gate; never start above the grant.
                let required = handle.config().approval_level;
                if required > granted {
                    warn!(
                        execution_id = %execution.execution_id,
                        step_id = %step.id,
                        agent_id = %handle.id(),
                        required = %required,
                        granted = %granted,
                        "Step agent exceeds granted approval"
                    );
                    let error = AgentError::from(OrchestrationError::ApprovalRequired { required, granted });
                    execution.steps.push(StepOutcome::unstarted(&step.id, Some(handle.id()), error.clone()));
                    halt = Some(Halt::Failed(consolidate(execution, &step.id, &error)));
                    break;
                }

                let payload = TaskPayload::new(step_action(step), step_input(step, execution));
                let policy = step.retry_policy(self.default_retry);
                let timeout = step.timeout();
                let step_id = step.id.clone();
                debug!(
                    execution_id = %execution.execution_id,
                    step_id = %step_id,
                    agent_id = %handle.id(),
                    "Starting step"
                );
                execution.current_step = Some(step_id.clone());
                running.spawn(async move {
                    let agent_id = handle.id().to_string();
                    // Inner task so a panicking agent fails its step instead of the workflow loop.
                    let result = match tokio::spawn(run_step(handle, payload.clone(), policy, timeout)).await {
                        Ok(result) => result,
                        Err(e) => TaskResult::from_agent_result(
                            &payload,
                            AgentResult::failed(
                                AgentError::new(
                                    ErrorKind::IllegalState,
                                    "step_panicked",
                                    e.to_string(),
                                ),
                                Duration::ZERO,
                            ),
                        ),
                    };
                    (step_id, Some(agent_id), result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let Ok((step_id, agent_id, result)) = joined else {
                // The outer wrapper never panics; only an abort can land here.
                continue;
            };

            execution.steps.push(StepOutcome {
                step_id: step_id.clone(),
                agent_id,
                status: result.status,
                attempts: result.attempt + 1,
                error: result.error.clone(),
                duration: result.duration,
            });

            match (result.status, result.data, result.error) {
                (TaskStatus::Succeeded, data, _) => {
                    debug!(execution_id = %execution.execution_id, step_id = %step_id, "Step succeeded");
                    execution.context.insert(step_id.clone(), data.unwrap_or(Value::Null));
                    completed.insert(step_id);
                }
                (_, _, error) => {
                    let error = error.unwrap_or_else(|| {
                        AgentError::validation("missing_result", "step finished without a result")
                    });
                    warn!(
                        execution_id = %execution.execution_id,
                        step_id = %step_id,
                        code = %error.code,
                        "Step failed"
                    );
                    if halt.is_none() {
                        halt = Some(Halt::Failed(consolidate(execution, &step_id, &error)));
                    }
                }
            }
        }

        if halt.is_none() && !waiting.is_empty() {
            // Every remaining step depends on one that never completed.
            let step_id = waiting.first().map_or_else(String::new, |s| s.id.clone());
            let error = AgentError::validation("unreachable_step", "dependencies never completed");
            halt = Some(Halt::Failed(consolidate(execution, &step_id, &error)));
        }
        halt
    }

    /// Resolves a step's agent, preferring tagged agents within `granted`.
    async fn resolve(&self, target: &StepTarget, granted: ApprovalLevel) -> Option<Arc<AgentHandle>> {
        let entry = match target {
            StepTarget::Agent(id) => self.registry.find_by_id(id).await,
            StepTarget::Tag(tag) => {
                let within = self
                    .registry
                    .find_by_tag(tag)
                    .await
                    .into_iter()
                    .filter(|e| {
                        let config = e.handle.config();
                        config.enabled && config.approval_level <= granted
                    })
                    .min_by_key(|e| load_key(&e.handle));
                match within {
                    Some(entry) => Some(entry),
                    None => self.registry.select_by_tag(tag).await,
                }
            }
        };
        entry.map(|e| e.handle)
    }

    async fn escalate(&self, definition: &WorkflowDefinition, execution: &WorkflowExecution) {
        let (Some(escalator), Some(failure)) = (&self.escalator, &execution.failure) else {
            return;
        };
        let kind = execution
            .step(&failure.step_id)
            .and_then(|s| s.error.as_ref())
            .map_or(ErrorKind::Transient, |e| e.kind);
        let error = AgentError::new(kind, failure.code.clone(), failure.to_string());
        escalator
            .escalate_failure(&format!("workflow:{}", definition.id), &error, definition.approval_level)
            .await;
    }

    async fn archive(&self, execution: &WorkflowExecution) {
        let Some(storage) = &self.storage else {
            return;
        };
        let record = match serde_json::to_value(execution) {
            Ok(record) => record,
            Err(e) => {
                warn!(execution_id = %execution.execution_id, error = %e, "Cannot serialize execution");
                return;
            }
        };
        if let Err(e) = storage.create(EXECUTIONS_COLLECTION, &execution.execution_id, record).await {
            warn!(execution_id = %execution.execution_id, error = %e, "Failed to archive execution");
        }
    }
}

fn consolidate(execution: &WorkflowExecution, step_id: &str, error: &AgentError) -> WorkflowFailure {
    WorkflowFailure {
        step_id: step_id.to_string(),
        code: error.code.clone(),
        message: error.message.clone(),
        context: execution.context.clone(),
    }
}

fn step_action(step: &WorkflowStep) -> String {
    if step.action.is_empty() { step.id.clone() } else { step.action.clone() }
}

/// Builds a step's input from the workflow input, its params and its dependencies' outputs.
fn step_input(step: &WorkflowStep, execution: &WorkflowExecution) -> Value {
    let dependencies: Map<String, Value> = step
        .depends_on
        .iter()
        .filter_map(|dep| execution.output(dep).map(|out| (dep.clone(), out.clone())))
        .collect();
    json!({
        "workflow_id": execution.workflow_id,
        "execution_id": execution.execution_id,
        "step_id": step.id,
        "input": execution.input,
        "params": step.params,
        "dependencies": dependencies,
    })
}

async fn run_step(
    handle: Arc<AgentHandle>,
    payload: TaskPayload,
    policy: RetryPolicy,
    timeout: Option<Duration>,
) -> TaskResult<Value> {
    policy
        .deliver(payload, |p| {
            let handle = Arc::clone(&handle);
            async move {
                match timeout {
                    None => execute_task_unescalated(&handle, &p).await,
                    Some(limit) => match tokio::time::timeout(limit, execute_task_unescalated(&handle, &p)).await {
                        Ok(result) => result,
                        Err(_) => TaskResult::from_agent_result(
                            &p,
                            AgentResult::failed(
                                AgentError::from(OrchestrationError::Timeout(limit)),
                                limit,
                            ),
                        ),
                    },
                }
            }
        })
        .await
}
