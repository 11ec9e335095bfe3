//! Catch-all agent for requests nobody else can handle.

use crate::agent::{Agent, AgentConfig, AgentContext};
use crate::error::Result;
use crate::escalation::Escalator;
use crate::routing::UNKNOWN_CATEGORY;
use async_trait::async_trait;
use conductor_abstraction::NotificationPriority;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// Category the classifier assigns to explicit escalation requests.
const ESCALATION_CATEGORY: &str = "escalation";

/// Notifies a human and asks the requester to clarify.
///
/// Explicit escalations (`urgent`, `outage`, ...) are sent at high priority;
/// anything that merely failed to classify is sent at low priority.
#[derive(Debug, Clone)]
pub struct EscalationAgent {
    config: AgentConfig,
    escalator: Arc<Escalator>,
}

impl EscalationAgent {
    /// Creates a new `EscalationAgent`.
    #[must_use]
    pub fn new(config: AgentConfig, escalator: Arc<Escalator>) -> Self {
        Self { config, escalator }
    }
}

#[async_trait]
impl Agent for EscalationAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn run(&self, context: AgentContext) -> Result<Value> {
        let category = context.str_field("/intent/category").unwrap_or(UNKNOWN_CATEGORY);
        let request = context.str_field("/request").unwrap_or_default();
        let priority = if category == ESCALATION_CATEGORY {
            NotificationPriority::High
        } else {
            NotificationPriority::Low
        };

        info!(
            agent_id = %self.config.id,
            category = %category,
            %priority,
            correlation_id = %context.metadata.correlation_id,
            "Escalating request"
        );
        let title = format!("Request needs attention ({})", category);
        self.escalator.notify(priority, &title, request).await;

        Ok(json!({
            "status": "needs_clarification",
            "category": category,
            "message": "A team member has been notified and will follow up.",
            "params": context.data.get("params").cloned().unwrap_or_else(|| json!({})),
        }))
    }
}
