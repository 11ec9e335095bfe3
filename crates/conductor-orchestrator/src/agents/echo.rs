//! Agent that returns its input.

use crate::agent::{Agent, AgentConfig, AgentContext};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// Returns the data it was given, tagged with its own ID.
#[derive(Debug, Clone)]
pub struct EchoAgent {
    config: AgentConfig,
}

impl EchoAgent {
    /// Creates a new `EchoAgent`.
    #[must_use]
    pub const fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn run(&self, context: AgentContext) -> Result<Value> {
        debug!(
            agent_id = %self.config.id,
            correlation_id = %context.metadata.correlation_id,
            "EchoAgent executing"
        );
        Ok(json!({
            "agent": self.config.id,
            "correlation_id": context.metadata.correlation_id,
            "echo": context.data,
        }))
    }
}
