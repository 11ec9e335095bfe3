//! Agent lifecycle management.
//!
//! [`AgentHandle`] owns one agent and enforces the lifecycle state machine:
//! `Created → Initializing → Ready → Running → Ready … → CleaningUp → Terminated`.
//! It applies the agent's timeout, normalizes errors into [`AgentResult`]s and
//! guarantees `cleanup` runs exactly once.

use crate::agent::{Agent, AgentConfig, AgentContext, AgentError, AgentResult};
use crate::error::{OrchestrationError, Result};
use crate::escalation::Escalator;
use crate::registry::AgentRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Constructed, not yet initialized.
    Created,
    /// `initialize` is in progress.
    Initializing,
    /// Accepting `run` calls.
    Ready,
    /// A `run` is in progress.
    Running,
    /// `cleanup` is in progress.
    CleaningUp,
    /// Discarded. No further calls are accepted.
    Terminated,
}

impl AgentState {
    /// Checks if the agent can transition to the given state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Initializing | Self::CleaningUp)
                | (Self::Initializing, Self::Ready | Self::CleaningUp)
                | (Self::Ready, Self::Running | Self::CleaningUp)
                | (Self::Running, Self::Ready)
                | (Self::CleaningUp, Self::Terminated)
        )
    }

    /// `true` once cleanup has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::CleaningUp | Self::Terminated)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::CleaningUp => "cleaning_up",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Lifecycle-managed agent.
pub struct AgentHandle {
    id: String,
    agent: Arc<dyn Agent>,
    config: RwLock<AgentConfig>,
    state: Mutex<AgentState>,
    /// Serializes `run` calls and lets `cleanup` wait for the one in flight.
    run_gate: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    cleaned_up: AtomicBool,
    escalator: Option<Arc<Escalator>>,
    registry: Mutex<Option<Weak<AgentRegistry>>>,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight counter when a `run` call ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Returns the handle to `Ready` if the caller's future is dropped mid-run.
struct Running<'a>(&'a AgentHandle);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == AgentState::Running {
            *state = AgentState::Ready;
        }
    }
}

impl AgentHandle {
    /// Wraps an agent in a fresh handle in the `Created` state.
    #[must_use]
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        let config = agent.config().clone();
        Self {
            id: config.id.clone(),
            agent,
            config: RwLock::new(config),
            state: Mutex::new(AgentState::Created),
            run_gate: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            cleaned_up: AtomicBool::new(false),
            escalator: None,
            registry: Mutex::new(None),
        }
    }

    /// Attaches an escalator for terminal failures.
    #[must_use]
    pub fn with_escalator(mut self, escalator: Arc<Escalator>) -> Self {
        self.escalator = Some(escalator);
        self
    }

    /// Agent ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Updates the configuration in place.
    ///
    /// # Errors
    /// Returns a `ConfigurationError` if the update changes the ID or produces
    /// an invalid configuration; the previous configuration is kept.
    pub fn update_config(&self, update: impl FnOnce(&mut AgentConfig)) -> Result<()> {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        update(&mut next);
        if next.id != self.id {
            return Err(OrchestrationError::Configuration(format!(
                "agent id cannot change from '{}' to '{}'",
                self.id, next.id
            )));
        }
        next.validate()?;
        debug!(agent_id = %self.id, "Agent configuration updated");
        *guard = next;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `run` calls waiting on or executing in this handle.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The wrapped agent.
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub(crate) fn attach_registry(&self, registry: Weak<AgentRegistry>) {
        *self.registry.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }

    /// Moves to `to`, failing with `IllegalState` if the move is not allowed.
    fn transition(&self, to: AgentState, operation: &'static str) -> Result<AgentState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::IllegalState {
                agent_id: self.id.clone(),
                operation,
                state: from,
            });
        }
        debug!(agent_id = %self.id, from = ?from, to = ?to, "State transition");
        *state = to;
        Ok(from)
    }

    /// Runs the agent's `initialize`.
    ///
    /// On failure the agent is cleaned up and terminated; `Ready` is never
    /// reached.
    ///
    /// # Errors
    /// `IllegalState` if called twice, otherwise a `ConfigurationError`
    /// wrapping the agent's failure or reporting a cleanup that overtook it.
    pub async fn initialize(&self) -> Result<()> {
        self.transition(AgentState::Initializing, "initialize")?;

        let timeout = self.config().timeout();
        let outcome = match tokio::time::timeout(timeout, self.agent.initialize()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrchestrationError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.transition(AgentState::Ready, "initialize") {
                    warn!(agent_id = %self.id, error = %e, "Cleanup raced initialize");
                    return Err(OrchestrationError::Configuration(format!(
                        "agent '{}' was cleaned up while initializing",
                        self.id
                    )));
                }
                info!(agent_id = %self.id, "Agent initialized");
                Ok(())
            }
            Err(e) => {
                error!(agent_id = %self.id, error = %e, "Agent failed to initialize");
                let err = OrchestrationError::Configuration(format!(
                    "agent '{}' failed to initialize: {}",
                    self.id, e
                ));
                self.escalate(&AgentError::from(&err)).await;
                if let Err(cleanup_err) = self.cleanup().await {
                    warn!(agent_id = %self.id, error = %cleanup_err, "Cleanup after failed initialize also failed");
                }
                Err(err)
            }
        }
    }

    /// Performs one unit of work.
    ///
    /// Concurrent callers are served one at a time. A call that finds the
    /// handle not `Ready` fails with `IllegalState` and tears the agent down.
    /// A run that exceeds the configured timeout is cancelled and reported as a
    /// retryable `timeout` failure. Non-retryable failures are escalated.
    pub async fn run(&self, context: AgentContext) -> AgentResult<Value> {
        self.run_with(context, true).await
    }

    /// Like [`AgentHandle::run`], leaving escalation to the caller.
    pub(crate) async fn run_unescalated(&self, context: AgentContext) -> AgentResult<Value> {
        self.run_with(context, false).await
    }

    async fn run_with(&self, context: AgentContext, escalate: bool) -> AgentResult<Value> {
        let started = Instant::now();
        let _in_flight = InFlight::enter(&self.in_flight);
        let gate = self.run_gate.lock().await;

        if let Err(violation) = self.transition(AgentState::Running, "run") {
            drop(gate);
            error!(agent_id = %self.id, error = %violation, "Lifecycle contract violated");
            let error = AgentError::from(&violation);
            if escalate {
                self.escalate(&error).await;
            }
            if !self.state().is_shutting_down() {
                if let Err(e) = self.cleanup().await {
                    warn!(agent_id = %self.id, error = %e, "Teardown after violation failed");
                }
            }
            return AgentResult::failed(error, started.elapsed());
        }
        let running = Running(self);

        let timeout = self.config().timeout();
        debug!(
            agent_id = %self.id,
            correlation_id = %context.metadata.correlation_id,
            "Agent run started"
        );
        let result = match tokio::time::timeout(timeout, self.agent.run(context)).await {
            Ok(Ok(output)) => AgentResult::ok(output, started.elapsed()),
            Ok(Err(e)) => {
                warn!(agent_id = %self.id, error = %e, retryable = e.is_retryable(), "Agent run failed");
                AgentResult::failed(AgentError::from(&e), started.elapsed())
            }
            Err(_) => {
                warn!(agent_id = %self.id, timeout_ms = timeout.as_millis(), "Agent run timed out");
                AgentResult::failed(
                    AgentError::from(&OrchestrationError::Timeout(timeout)),
                    started.elapsed(),
                )
            }
        };

        drop(running);
        drop(gate);

        if let Some(error) = result.error.as_ref().filter(|e| escalate && !e.retryable) {
            self.escalate(error).await;
        }
        result
    }

    /// Releases the agent's resources and unregisters it.
    ///
    /// Runs at most once; later calls are no-ops. Waits for an in-progress
    /// `run` to finish first.
    pub async fn cleanup(&self) -> Result<()> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!(agent_id = %self.id, "Cleanup already performed");
            return Ok(());
        }

        let _gate = self.run_gate.lock().await;
        self.transition(AgentState::CleaningUp, "cleanup")?;

        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(registry) = registry.and_then(|weak| weak.upgrade()) {
            registry.unregister(&self.id).await;
        }

        let timeout = self.config().timeout();
        let outcome = match tokio::time::timeout(timeout, self.agent.cleanup()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrchestrationError::Timeout(timeout)),
        };
        self.transition(AgentState::Terminated, "cleanup")?;

        match &outcome {
            Ok(()) => info!(agent_id = %self.id, "Agent terminated"),
            Err(e) => error!(agent_id = %self.id, error = %e, "Agent cleanup failed"),
        }
        outcome
    }

    /// Escalates a terminal failure through the attached escalator.
    pub(crate) async fn escalate(&self, error: &AgentError) {
        if let Some(escalator) = &self.escalator {
            let approval = self.config().approval_level;
            escalator.escalate_failure(&self.id, error, approval).await;
        }
    }
}

/// Caller-side retry policy.
///
/// The agent never retries itself: the parent or orchestrator re-invokes it
/// after `retry_delay`, at most `max_retries` extra times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    #[must_use]
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self { max_retries, retry_delay }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// The policy declared in an agent's configuration.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// Runs the agent, replaying the context after each retryable failure.
    ///
    /// A retryable failure that exhausts the budget is terminal and escalated.
    pub async fn run(&self, handle: &AgentHandle, context: AgentContext) -> AgentResult<Value> {
        let mut attempt = 0;
        loop {
            let result = handle.run(context.clone()).await;
            if !result.is_retryable() {
                return result;
            }
            if attempt >= self.max_retries {
                warn!(
                    agent_id = %handle.id(),
                    attempts = attempt + 1,
                    "Retry budget exhausted"
                );
                if let Some(error) = &result.error {
                    handle.escalate(error).await;
                }
                return result;
            }
            attempt += 1;
            warn!(
                agent_id = %handle.id(),
                attempt,
                max_retries = self.max_retries,
                "Retrying agent after retryable failure"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
