//! Workflow definitions and load-time validation.
//!
//! Steps form a DAG through `depends_on`. A definition is only accepted into
//! a [`WorkflowCatalog`] once every dependency resolves and the graph is
//! acyclic, so nothing ever starts executing a broken plan.

use crate::agent::{ApprovalLevel, duration_to_ms};
use crate::error::{OrchestrationError, Result};
use crate::lifecycle::RetryPolicy;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Agent a step runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepTarget {
    /// A specific agent ID.
    Agent(String),
    /// The least-loaded agent carrying a tag.
    Tag(String),
}

impl fmt::Display for StepTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent '{}'", id),
            Self::Tag(tag) => write!(f, "tag '{}'", tag),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within the workflow.
    pub id: String,
    /// Agent to run on.
    pub target: StepTarget,
    /// Action name passed to the agent as `task_type`.
    #[serde(default)]
    pub action: String,
    /// Steps whose outputs feed this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Static parameters merged into the step input.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Extra attempts after a retryable failure; the orchestrator default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Delay between attempts, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Upper bound for one attempt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    /// Creates a step with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, target: StepTarget) -> Self {
        let id = id.into();
        Self {
            action: id.clone(),
            id,
            target,
            depends_on: Vec::new(),
            params: Value::Null,
            max_retries: None,
            retry_delay_ms: None,
            timeout_ms: None,
        }
    }

    /// Sets the action name.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Sets static parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Sets the step's own retry budget.
    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay_ms = Some(duration_to_ms(retry_delay));
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(duration_to_ms(timeout));
        self
    }

    /// The step's retry policy, falling back to `default` for unset fields.
    #[must_use]
    pub fn retry_policy(&self, default: RetryPolicy) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.unwrap_or(default.max_retries),
            self.retry_delay_ms.map_or(default.retry_delay, Duration::from_millis),
        )
    }

    /// Per-attempt timeout, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A named DAG of agent invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the workflow does.
    #[serde(default)]
    pub description: String,
    /// Approval required to start the workflow.
    #[serde(default)]
    pub approval_level: ApprovalLevel,
    /// Steps, in declaration order.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            approval_level: ApprovalLevel::Low,
            steps: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the approval level.
    #[must_use]
    pub fn with_approval_level(mut self, level: ApprovalLevel) -> Self {
        self.approval_level = level;
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Looks up a step.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validates the definition and returns its steps in dependency order.
    ///
    /// # Errors
    /// `ConfigurationError` for an empty ID or step list, duplicate step IDs,
    /// unknown or self dependencies, and cycles.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let invalid = |reason: String| {
            OrchestrationError::Configuration(format!("workflow '{}': {}", self.id, reason))
        };

        if self.id.trim().is_empty() {
            return Err(OrchestrationError::Configuration("workflow id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("has no steps".into()));
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for step in &self.steps {
            if nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str())).is_some() {
                return Err(invalid(format!("step '{}' is declared twice", step.id)));
            }
        }

        for step in &self.steps {
            let to = nodes[step.id.as_str()];
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(invalid(format!("step '{}' depends on itself", step.id)));
                }
                let from = nodes.get(dep.as_str()).ok_or_else(|| {
                    invalid(format!("step '{}' depends on unknown step '{}'", step.id, dep))
                })?;
                // Edge points from the dependency to the dependent.
                graph.add_edge(*from, to, ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| graph[idx].to_string()).collect()),
            Err(cycle) => {
                let mut members = tarjan_scc(&graph)
                    .into_iter()
                    .find(|scc| scc.contains(&cycle.node_id()))
                    .unwrap_or_else(|| vec![cycle.node_id()])
                    .into_iter()
                    .map(|idx| graph[idx])
                    .collect::<Vec<_>>();
                members.sort_unstable();
                Err(invalid(format!("dependency cycle between steps {}", members.join(", "))))
            }
        }
    }

    /// Validates the definition.
    ///
    /// # Errors
    /// See [`WorkflowDefinition::execution_order`].
    pub fn validate(&self) -> Result<()> {
        self.execution_order().map(|_| ())
    }
}

/// Validated workflow definitions, keyed by ID.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    definitions: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog, rejecting the whole set if any definition is invalid.
    ///
    /// # Errors
    /// The first definition error.
    pub fn load(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Result<Self> {
        let mut catalog = Self::new();
        for definition in definitions {
            catalog.insert(definition)?;
        }
        Ok(catalog)
    }

    /// Validates and adds a definition.
    ///
    /// # Errors
    /// `ConfigurationError` if the definition is invalid or its ID is taken.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let order = definition.execution_order()?;
        if self.definitions.contains_key(&definition.id) {
            return Err(OrchestrationError::Configuration(format!(
                "workflow '{}' is declared twice",
                definition.id
            )));
        }
        debug!(workflow_id = %definition.id, order = ?order, "Workflow loaded");
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Looks up a definition.
    pub fn get(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(id)
    }

    /// Workflow IDs, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    /// Definitions, sorted by ID.
    pub fn definitions(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.definitions.values()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// `true` when the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> StepTarget {
        StepTarget::Agent(id.to_string())
    }

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("close", "Close")
            .with_step(WorkflowStep::new("c", agent("x")).depends_on("b"))
            .with_step(WorkflowStep::new("a", agent("x")))
            .with_step(WorkflowStep::new("b", agent("x")).depends_on("a"))
    }

    #[test]
    fn test_execution_order() {
        assert_eq!(chain().execution_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let cyclic = WorkflowDefinition::new("loop", "Loop")
            .with_step(WorkflowStep::new("a", agent("x")).depends_on("c"))
            .with_step(WorkflowStep::new("b", agent("x")).depends_on("a"))
            .with_step(WorkflowStep::new("c", agent("x")).depends_on("b"));

        let err = WorkflowCatalog::load([cyclic]).unwrap_err();
        match err {
            OrchestrationError::Configuration(msg) => assert!(msg.contains("a, b, c"), "{}", msg),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_definitions() {
        let empty = WorkflowDefinition::new("empty", "Empty");
        assert!(empty.validate().is_err());

        let unknown = WorkflowDefinition::new("w", "W")
            .with_step(WorkflowStep::new("a", agent("x")).depends_on("ghost"));
        assert!(unknown.validate().is_err());

        let selfdep =
            WorkflowDefinition::new("w", "W").with_step(WorkflowStep::new("a", agent("x")).depends_on("a"));
        assert!(selfdep.validate().is_err());

        let duplicate = WorkflowDefinition::new("w", "W")
            .with_step(WorkflowStep::new("a", agent("x")))
            .with_step(WorkflowStep::new("a", agent("y")));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicate_workflow() {
        let mut catalog = WorkflowCatalog::new();
        catalog.insert(chain()).unwrap();
        assert!(catalog.insert(chain()).is_err());
        assert_eq!(catalog.ids(), vec!["close"]);
    }

    #[test]
    fn test_step_retry_policy_defaults() {
        let default = RetryPolicy::new(3, Duration::from_millis(100));
        let plain = WorkflowStep::new("a", agent("x"));
        assert_eq!(plain.retry_policy(default), default);

        let custom = plain.with_retry(1, Duration::from_millis(5));
        assert_eq!(custom.retry_policy(default), RetryPolicy::new(1, Duration::from_millis(5)));
    }

    #[test]
    fn test_definition_from_toml() {
        let definition: WorkflowDefinition = toml::from_str(
            r#"
            id = "month_end_close"
            name = "Month-end close"
            approval_level = "medium"

            [[steps]]
            id = "reconcile"
            target = { tag = "ledger" }

            [[steps]]
            id = "report"
            target = { agent = "reporting" }
            depends_on = ["reconcile"]
            max_retries = 1
            "#,
        )
        .unwrap();

        assert_eq!(definition.approval_level, ApprovalLevel::Medium);
        assert_eq!(definition.steps[0].target, StepTarget::Tag("ledger".into()));
        assert_eq!(definition.steps[0].action, "");
        assert_eq!(definition.steps[1].max_retries, Some(1));
        assert!(definition.validate().is_ok());
    }
}
