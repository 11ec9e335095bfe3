//! Out-of-band escalation of terminal failures.
//!
//! The escalator sits in front of the external [`Notifier`]: it filters
//! failures by severity, computes a [`NotificationPriority`] and swallows
//! delivery errors after logging them.

use crate::agent::{AgentError, ApprovalLevel};
use crate::error::{ErrorKind, OrchestrationError};
use conductor_abstraction::{NotificationPriority, Notifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Severity of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected outcome, nothing to do.
    Info,
    /// Caller-side problem.
    Warning,
    /// Work could not be completed.
    #[default]
    Error,
    /// The system itself is misconfigured or broken.
    Critical,
}

impl Severity {
    /// Severity of a terminal failure of the given kind.
    #[must_use]
    pub fn of(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Configuration | ErrorKind::IllegalState => Self::Critical,
            ErrorKind::Transient => Self::Error,
            ErrorKind::Validation => Self::Warning,
            ErrorKind::ApprovalRequired | ErrorKind::Cancelled => Self::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(OrchestrationError::Configuration(format!(
                "Invalid severity: {}. Valid options: info, warning, error, critical",
                other
            ))),
        }
    }
}

/// Computes the notification priority for a failure.
///
/// Agents gated at `High` or above bump error and warning priorities one step.
#[must_use]
pub fn priority_for(severity: Severity, approval: ApprovalLevel) -> NotificationPriority {
    let sensitive = approval >= ApprovalLevel::High;
    match severity {
        Severity::Critical => NotificationPriority::Urgent,
        Severity::Error if sensitive => NotificationPriority::Urgent,
        Severity::Error => NotificationPriority::High,
        Severity::Warning if sensitive => NotificationPriority::High,
        Severity::Warning | Severity::Info => NotificationPriority::Low,
    }
}

/// Default escalation channel.
pub const DEFAULT_CHANNEL: &str = "escalations";

/// Notification escalator.
#[derive(Clone)]
pub struct Escalator {
    notifier: Arc<dyn Notifier>,
    threshold: Severity,
    channel: String,
}

impl fmt::Debug for Escalator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Escalator")
            .field("threshold", &self.threshold)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Escalator {
    /// Creates an escalator that forwards `Error` and above to the default channel.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier, threshold: Severity::Error, channel: DEFAULT_CHANNEL.to_string() }
    }

    /// Sets the minimum severity that is forwarded.
    #[must_use]
    pub fn with_threshold(mut self, threshold: Severity) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the destination channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Minimum forwarded severity.
    #[must_use]
    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Escalates a terminal failure if its severity reaches the threshold.
    ///
    /// Returns `true` when a notification was handed to the sink.
    pub async fn escalate_failure(
        &self,
        source_id: &str,
        error: &AgentError,
        approval: ApprovalLevel,
    ) -> bool {
        let severity = Severity::of(error.kind);
        if severity < self.threshold {
            debug!(
                source_id = %source_id,
                %severity,
                threshold = %self.threshold,
                "Failure below escalation threshold"
            );
            return false;
        }

        let priority = priority_for(severity, approval);
        let title = format!("{} failure in '{}'", severity, source_id);
        self.notify(priority, &title, &error.to_string()).await;
        true
    }

    /// Sends a notification, logging (never propagating) delivery failures.
    pub async fn notify(&self, priority: NotificationPriority, title: &str, message: &str) {
        debug!(channel = %self.channel, %priority, title = %title, "Escalating");
        if let Err(e) = self.notifier.send(priority, &self.channel, title, message).await {
            warn!(channel = %self.channel, error = %e, "Escalation delivery failed");
        }
    }
}
