//! Agent contract and the values that flow through it.
//!
//! Every agent, main or sub, implements [`Agent`]. The lifecycle core
//! ([`crate::lifecycle::AgentHandle`]) drives the trait methods and normalizes
//! whatever the agent returns into an [`AgentResult`].

use crate::delegation::{Progress, ProgressReporter};
use crate::error::{ErrorKind, OrchestrationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Ordered severity of human gating required before an action executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalLevel {
    /// Safe to auto-execute.
    #[default]
    Low,
    /// Needs an operator.
    Medium,
    /// Needs a manager.
    High,
    /// Needs an executive sign-off.
    Urgent,
}

impl fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for ApprovalLevel {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(OrchestrationError::Validation(format!(
                "Invalid approval level: {}. Valid options: low, medium, high, urgent",
                other
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Static configuration of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the agent does.
    #[serde(default)]
    pub description: String,
    /// Disabled agents are skipped by routing.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra attempts a caller may make after a retryable failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound for a single `run`, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Approval required before this agent's actions run.
    #[serde(default)]
    pub approval_level: ApprovalLevel,
    /// Cron-style schedule, interpreted by an external scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl AgentConfig {
    /// Creates a configuration with default retry, timeout and approval settings.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            approval_level: ApprovalLevel::Low,
            schedule: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the retry budget and delay.
    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = duration_to_ms(retry_delay);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Sets the approval level.
    #[must_use]
    pub fn with_approval_level(mut self, level: ApprovalLevel) -> Self {
        self.approval_level = level;
        self
    }

    /// Sets the schedule expression.
    #[must_use]
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Marks the agent as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Delay between attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Timeout for a single run.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks the configuration for values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestrationError::Configuration("agent id must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(OrchestrationError::Configuration(format!(
                "agent '{}' has a zero timeout",
                self.id
            )));
        }
        Ok(())
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Request metadata attached to every execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Correlates logs and notifications across components.
    pub correlation_id: String,
    /// When the request entered the system.
    pub received_at: DateTime<Utc>,
    /// Who asked, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            requested_by: None,
        }
    }
}

/// Input envelope for a single execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    /// Arbitrary structured input.
    pub data: Value,
    /// Request metadata.
    pub metadata: RequestMetadata,
    #[serde(skip)]
    reporter: Option<ProgressReporter>,
}

impl AgentContext {
    /// Creates a context with fresh metadata.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self { data, metadata: RequestMetadata::default(), reporter: None }
    }

    /// Uses the given correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = correlation_id.into();
        self
    }

    /// Records who made the request.
    #[must_use]
    pub fn with_requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.metadata.requested_by = Some(requested_by.into());
        self
    }

    pub(crate) fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Looks up a string field in the input data.
    pub fn str_field(&self, pointer: &str) -> Option<&str> {
        self.data.pointer(pointer).and_then(Value::as_str)
    }

    /// Reports progress to the delegating parent, if there is one.
    ///
    /// Outside a delegated task this is a no-op.
    pub fn report_progress(&self, percent: u8, step: impl Into<String>, message: impl Into<String>) {
        if let Some(reporter) = &self.reporter {
            reporter.report(Progress::new(percent, step, message));
        }
    }
}

/// Normalized failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether a caller may re-attempt.
    pub retryable: bool,
}

impl AgentError {
    /// Creates an error whose retryability follows its kind.
    #[must_use]
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, code: code.into(), message: message.into(), retryable: kind.is_retryable() }
    }

    /// Retryable failure.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    /// Non-retryable input failure.
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }
}

impl From<&OrchestrationError> for AgentError {
    fn from(err: &OrchestrationError) -> Self {
        Self::new(err.kind(), err.code(), err.to_string())
    }
}

impl From<OrchestrationError> for AgentError {
    fn from(err: OrchestrationError) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AgentError {}

/// Outcome of a full agent `run` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult<T = Value> {
    /// Whether the run succeeded.
    pub success: bool,
    /// Output on success.
    pub data: Option<T>,
    /// Failure detail.
    pub error: Option<AgentError>,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl<T> AgentResult<T> {
    /// Successful result.
    #[must_use]
    pub fn ok(data: T, duration: Duration) -> Self {
        Self { success: true, data: Some(data), error: None, duration }
    }

    /// Failed result.
    #[must_use]
    pub fn failed(error: AgentError, duration: Duration) -> Self {
        Self { success: false, data: None, error: Some(error), duration }
    }

    /// `true` when the run failed with a retryable error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error.as_ref().is_some_and(|e| e.retryable)
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> std::result::Result<T, AgentError> {
        match (self.data, self.error) {
            (Some(data), None) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            _ => Err(AgentError::validation("missing_output", "agent returned no data")),
        }
    }
}

impl AgentResult<Value> {
    /// Decodes the JSON output into a typed value.
    ///
    /// A decode failure turns the result into a non-retryable validation failure.
    pub fn decode<T: DeserializeOwned>(self) -> AgentResult<T> {
        let Self { success, data, error, duration } = self;
        match data {
            Some(value) if success => match serde_json::from_value(value) {
                Ok(typed) => AgentResult::ok(typed, duration),
                Err(e) => AgentResult::failed(
                    AgentError::validation("invalid_output", format!("cannot decode output: {}", e)),
                    duration,
                ),
            },
            _ => AgentResult { success, data: None, error, duration },
        }
    }
}

/// Lifecycle capability every agent implements.
///
/// `run` must be safe to call repeatedly: callers replay it on retry.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the agent's configuration.
    fn config(&self) -> &AgentConfig;

    /// Returns the unique ID of the agent.
    fn id(&self) -> &str {
        &self.config().id
    }

    /// Prepares resources. Completes before any `run` is accepted.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Performs one logical unit of work.
    async fn run(&self, context: AgentContext) -> Result<Value>;

    /// Releases resources. Called exactly once, even if `initialize` failed.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
