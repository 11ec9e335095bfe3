//! Request routing.
//!
//! The router turns a classified intent into a target: a workflow, an agent
//! matched by tag, the category's default agent, or the catch-all handler.
//! It never executes anything and never changes approval levels; a target that
//! needs more approval than the caller holds comes back as `PendingApproval`.

use super::classifier::{Intent, IntentClassifier, UNKNOWN_CATEGORY};
use crate::agent::ApprovalLevel;
use crate::error::{OrchestrationError, Result};
use crate::registry::AgentRegistry;
use crate::workflow::WorkflowOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Default catch-all agent ID.
pub const DEFAULT_CATCH_ALL: &str = "escalation";

/// A request to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRequest {
    /// Free-form input.
    pub input: String,
    /// Approval level the requester holds.
    #[serde(default)]
    pub granted: ApprovalLevel,
    /// Who is asking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// Structured data forwarded to the target with the extracted params.
    #[serde(default)]
    pub data: Value,
}

impl RoutingRequest {
    /// Creates a request holding `Low` approval.
    #[must_use]
    pub fn new(input: impl Into<String>) -> Self {
        Self { input: input.into(), granted: ApprovalLevel::Low, requested_by: None, data: Value::Null }
    }

    /// Sets the granted approval level.
    #[must_use]
    pub fn with_granted(mut self, granted: ApprovalLevel) -> Self {
        self.granted = granted;
        self
    }

    /// Records the requester.
    #[must_use]
    pub fn with_requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = Some(requested_by.into());
        self
    }

    /// Attaches structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Direct invocation of one agent.
    Agent(String),
    /// A workflow run.
    Workflow(String),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{}", id),
            Self::Workflow(id) => write!(f, "workflow:{}", id),
        }
    }
}

/// Whether a decision may execute now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    /// The requester holds enough approval.
    Ready,
    /// Execution waits for a higher approval level.
    PendingApproval,
}

/// Which resolution step produced the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The category is bound to a workflow.
    Workflow,
    /// An agent carrying the category's tag.
    TagMatch,
    /// The category's designated default agent.
    DefaultAgent,
    /// The configured catch-all handler.
    CatchAll,
}

/// Outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// The classified intent.
    pub intent: Intent,
    /// Resolved target.
    pub target: RouteTarget,
    /// Approval the target requires.
    pub required_approval: ApprovalLevel,
    /// Approval the requester holds.
    pub granted_approval: ApprovalLevel,
    /// Ready or pending approval.
    pub state: DecisionState,
    /// How the target was found.
    pub resolution: Resolution,
    /// Human-readable explanation.
    pub rationale: String,
}

impl RoutingDecision {
    /// `true` when execution must wait for approval.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == DecisionState::PendingApproval
    }
}

/// Routing entry for one intent category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRoute {
    /// Intent category.
    pub category: String,
    /// Agent tag to match; defaults to the category name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Agent used when no tagged agent is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
    /// Workflow that handles the category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Minimum approval for the category, on top of the target's own.
    #[serde(default)]
    pub approval_level: ApprovalLevel,
}

impl CategoryRoute {
    /// A route matching agents tagged with the category name.
    #[must_use]
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            tag: None,
            default_agent: None,
            workflow: None,
            approval_level: ApprovalLevel::Low,
        }
    }

    /// Matches a different tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the default agent.
    #[must_use]
    pub fn with_default_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.default_agent = Some(agent_id.into());
        self
    }

    /// Binds the category to a workflow.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow = Some(workflow_id.into());
        self
    }

    /// Sets the category's approval level.
    #[must_use]
    pub fn with_approval_level(mut self, level: ApprovalLevel) -> Self {
        self.approval_level = level;
        self
    }

    /// Tag used for agent matching.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.category)
    }
}

fn default_catch_all() -> String {
    DEFAULT_CATCH_ALL.to_string()
}

/// Routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Agent that receives `unknown` intents and anything nothing else claims.
    #[serde(default = "default_catch_all")]
    pub catch_all: String,
    /// Per-category routes.
    #[serde(default)]
    pub categories: Vec<CategoryRoute>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            catch_all: default_catch_all(),
            categories: vec![
                CategoryRoute::new("inventory_query").with_tag("inventory"),
                CategoryRoute::new("order_status").with_tag("orders"),
                CategoryRoute::new("month_end_close")
                    .with_workflow("month_end_close")
                    .with_approval_level(ApprovalLevel::Medium),
                CategoryRoute::new("escalation").with_default_agent(DEFAULT_CATCH_ALL),
            ],
        }
    }
}

impl RoutingConfig {
    /// Checks the table for empty or duplicate entries.
    ///
    /// # Errors
    /// Returns `ConfigurationError` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.catch_all.trim().is_empty() {
            return Err(OrchestrationError::Configuration("routing catch_all must be set".into()));
        }
        let mut seen = HashSet::new();
        for route in &self.categories {
            if route.category == UNKNOWN_CATEGORY {
                return Err(OrchestrationError::Configuration(format!(
                    "category '{}' always routes to the catch-all",
                    UNKNOWN_CATEGORY
                )));
            }
            if !seen.insert(route.category.as_str()) {
                return Err(OrchestrationError::Configuration(format!(
                    "category '{}' is routed twice",
                    route.category
                )));
            }
        }
        Ok(())
    }

    /// Route for `category`, if declared.
    pub fn route_for(&self, category: &str) -> Option<&CategoryRoute> {
        self.categories.iter().find(|r| r.category == category)
    }
}

/// Intent router.
pub struct AgentRouter {
    classifier: Arc<IntentClassifier>,
    config: RoutingConfig,
    registry: Arc<AgentRegistry>,
    workflows: Option<Arc<WorkflowOrchestrator>>,
}

impl fmt::Debug for AgentRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRouter")
            .field("catch_all", &self.config.catch_all)
            .field("categories", &self.config.categories.len())
            .finish_non_exhaustive()
    }
}

impl AgentRouter {
    /// Creates a router.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if the routing table is invalid.
    pub fn new(
        classifier: Arc<IntentClassifier>,
        config: RoutingConfig,
        registry: Arc<AgentRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { classifier, config, registry, workflows: None })
    }

    /// Enables workflow-bound categories.
    #[must_use]
    pub fn with_workflows(mut self, workflows: Arc<WorkflowOrchestrator>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// The classifier in front of the router.
    pub fn classifier(&self) -> &Arc<IntentClassifier> {
        &self.classifier
    }

    /// The routing table.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Classifies and routes a request.
    ///
    /// # Errors
    /// `AgentNotFound` when nothing, not even the catch-all, is registered;
    /// `WorkflowNotFound` when the category names an unknown workflow.
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingDecision> {
        let intent = self.classifier.classify(&request.input);
        self.route_intent(intent, request.granted).await
    }

    /// Routes an already classified intent.
    ///
    /// # Errors
    /// See [`AgentRouter::route`].
    pub async fn route_intent(
        &self,
        intent: Intent,
        granted: ApprovalLevel,
    ) -> Result<RoutingDecision> {
        let (target, resolution, required, rationale) = self.resolve(&intent).await?;
        let state = if required > granted {
            DecisionState::PendingApproval
        } else {
            DecisionState::Ready
        };

        info!(
            category = %intent.category,
            confidence = intent.confidence,
            route = %target,
            resolution = ?resolution,
            required = %required,
            granted = %granted,
            state = ?state,
            "Routed request"
        );

        Ok(RoutingDecision {
            intent,
            target,
            required_approval: required,
            granted_approval: granted,
            state,
            resolution,
            rationale,
        })
    }

    async fn resolve(
        &self,
        intent: &Intent,
    ) -> Result<(RouteTarget, Resolution, ApprovalLevel, String)> {
        if intent.is_unknown() {
            let rationale = format!(
                "confidence {:.2} is below the floor {:.2}",
                intent.confidence,
                self.classifier.floor()
            );
            return self.catch_all(ApprovalLevel::Low, rationale).await;
        }

        let route = self.config.route_for(&intent.category);
        let category_level = route.map_or(ApprovalLevel::Low, |r| r.approval_level);

        if let Some(workflow_id) = route.and_then(|r| r.workflow.as_deref()) {
            let workflows = self.workflows.as_ref().ok_or_else(|| {
                OrchestrationError::Configuration(format!(
                    "category '{}' is bound to workflow '{}' but no orchestrator is attached",
                    intent.category, workflow_id
                ))
            })?;
            let required = workflows.required_approval(workflow_id).await?.max(category_level);
            return Ok((
                RouteTarget::Workflow(workflow_id.to_string()),
                Resolution::Workflow,
                required,
                format!("category '{}' is handled by workflow '{}'", intent.category, workflow_id),
            ));
        }

        let tag = route.map_or(intent.category.as_str(), CategoryRoute::tag);
        if let Some(entry) = self.registry.select_by_tag(tag).await {
            let required = entry.handle.config().approval_level.max(category_level);
            return Ok((
                RouteTarget::Agent(entry.id().to_string()),
                Resolution::TagMatch,
                required,
                format!(
                    "least loaded agent tagged '{}' ({} in flight)",
                    tag,
                    entry.handle.in_flight()
                ),
            ));
        }

        if let Some(default_id) = route.and_then(|r| r.default_agent.as_deref()) {
            match self.registry.find_by_id(default_id).await {
                Some(entry) if entry.handle.config().enabled => {
                    let required = entry.handle.config().approval_level.max(category_level);
                    return Ok((
                        RouteTarget::Agent(default_id.to_string()),
                        Resolution::DefaultAgent,
                        required,
                        format!("no agent tagged '{}', using the category default", tag),
                    ));
                }
                _ => debug!(agent_id = %default_id, "Default agent unavailable"),
            }
        }

        self.catch_all(category_level, format!("no agent available for category '{}'", intent.category))
            .await
    }

    async fn catch_all(
        &self,
        floor: ApprovalLevel,
        rationale: String,
    ) -> Result<(RouteTarget, Resolution, ApprovalLevel, String)> {
        let id = &self.config.catch_all;
        let entry = self
            .registry
            .find_by_id(id)
            .await
            .ok_or_else(|| OrchestrationError::AgentNotFound(id.clone()))?;
        let required = entry.handle.config().approval_level.max(floor);
        Ok((RouteTarget::Agent(id.clone()), Resolution::CatchAll, required, rationale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig, AgentContext};
    use crate::lifecycle::AgentHandle;
    use crate::registry::Registration;
    use crate::routing::classifier::ClassifierConfig;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubAgent(AgentConfig);

    #[async_trait]
    impl Agent for StubAgent {
        fn config(&self) -> &AgentConfig {
            &self.0
        }

        async fn run(&self, _context: AgentContext) -> Result<Value> {
            Ok(json!({}))
        }
    }

    async fn spawn(registry: &Arc<AgentRegistry>, config: AgentConfig, tags: &[&str]) {
        let handle = Arc::new(AgentHandle::new(Arc::new(StubAgent(config))));
        registry
            .spawn(handle, Registration::main().with_tags(tags.iter().copied()))
            .await
            .unwrap();
    }

    async fn router() -> (AgentRouter, Arc<AgentRegistry>) {
        let registry = Arc::new(AgentRegistry::new());
        spawn(&registry, AgentConfig::new("escalation", "Escalation"), &[]).await;
        let classifier = Arc::new(IntentClassifier::from_config(&ClassifierConfig::default()).unwrap());
        let router =
            AgentRouter::new(classifier, RoutingConfig::default(), Arc::clone(&registry)).unwrap();
        (router, registry)
    }

    #[tokio::test]
    async fn test_tag_match() {
        let (router, registry) = router().await;
        spawn(&registry, AgentConfig::new("inventory-1", "Inventory"), &["inventory"]).await;

        let decision = router.route(&RoutingRequest::new("check inventory for SKU-123")).await.unwrap();
        assert_eq!(decision.target, RouteTarget::Agent("inventory-1".into()));
        assert_eq!(decision.resolution, Resolution::TagMatch);
        assert_eq!(decision.required_approval, ApprovalLevel::Low);
        assert_eq!(decision.state, DecisionState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_goes_to_catch_all() {
        let (router, registry) = router().await;
        spawn(&registry, AgentConfig::new("inventory-1", "Inventory"), &["inventory"]).await;

        let decision = router.route(&RoutingRequest::new("tell me a joke")).await.unwrap();
        assert!(decision.intent.is_unknown());
        assert_eq!(decision.target, RouteTarget::Agent("escalation".into()));
        assert_eq!(decision.resolution, Resolution::CatchAll);
    }

    #[tokio::test]
    async fn test_default_agent_then_catch_all() {
        let (router, _registry) = router().await;

        // No agent tagged "orders" and no default: catch-all.
        let decision = router.route(&RoutingRequest::new("status of order ORD-7")).await.unwrap();
        assert_eq!(decision.resolution, Resolution::CatchAll);

        // "escalation" names the catch-all as its default agent.
        let decision = router.route(&RoutingRequest::new("urgent outage")).await.unwrap();
        assert_eq!(decision.resolution, Resolution::DefaultAgent);
        assert_eq!(decision.target, RouteTarget::Agent("escalation".into()));
    }

    #[tokio::test]
    async fn test_pending_approval() {
        let (router, registry) = router().await;
        spawn(
            &registry,
            AgentConfig::new("inventory-1", "Inventory").with_approval_level(ApprovalLevel::High),
            &["inventory"],
        )
        .await;

        let low = router.route(&RoutingRequest::new("inventory SKU-1")).await.unwrap();
        assert!(low.is_pending());
        assert_eq!(low.required_approval, ApprovalLevel::High);
        assert_eq!(low.granted_approval, ApprovalLevel::Low);

        let high = router
            .route(&RoutingRequest::new("inventory SKU-1").with_granted(ApprovalLevel::Urgent))
            .await
            .unwrap();
        assert!(!high.is_pending());
        assert_eq!(high.required_approval, ApprovalLevel::High);
    }

    #[tokio::test]
    async fn test_workflow_category_without_orchestrator() {
        let (router, _registry) = router().await;
        let err = router.route(&RoutingRequest::new("month end close 2024-01")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_catch_all() {
        let registry = Arc::new(AgentRegistry::new());
        let classifier = Arc::new(IntentClassifier::from_config(&ClassifierConfig::default()).unwrap());
        let router = AgentRouter::new(classifier, RoutingConfig::default(), registry).unwrap();

        let err = router.route(&RoutingRequest::new("???")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AgentNotFound(id) if id == "escalation"));
    }

    #[test]
    fn test_routing_config_validation() {
        let mut config = RoutingConfig::default();
        assert!(config.validate().is_ok());
        config.categories.push(CategoryRoute::new("inventory_query"));
        assert!(config.validate().is_err());

        let config = RoutingConfig { catch_all: String::new(), categories: Vec::new() };
        assert!(config.validate().is_err());
    }
}
