//! Sub-agent delegation.
//!
//! A parent hands work to a sub-agent as a [`TaskPayload`] and receives a
//! [`TaskResult`] back. Completion, progress, errors and free-form
//! notifications travel upward over a per-parent channel ([`ParentLink`] on
//! the child side, [`ParentInbox`] on the parent side).

use crate::agent::{AgentContext, AgentError, AgentResult};
use crate::lifecycle::{AgentHandle, AgentState, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_abstraction::NotificationPriority;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Status of a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task completed.
    Succeeded,
    /// The task failed; see the error.
    Failed,
    /// The task is still running.
    InProgress,
}

/// Unit of work handed from a parent to a sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Unique per delegation; kept across re-deliveries.
    pub task_id: String,
    /// Kind of work requested.
    pub task_type: String,
    /// Higher is more urgent.
    pub priority: u32,
    /// Task input.
    pub data: Value,
    /// When the task was first created.
    pub created_at: DateTime<Utc>,
    /// Number of re-deliveries so far.
    pub retry_count: u32,
}

impl TaskPayload {
    /// Creates a first-delivery payload with a fresh task ID.
    #[must_use]
    pub fn new(task_type: impl Into<String>, data: Value) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            priority: 0,
            data,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The same task, delivered once more.
    #[must_use]
    pub fn redeliver(&self) -> Self {
        Self { retry_count: self.retry_count + 1, ..self.clone() }
    }

    /// Builds the context the sub-agent's `run` receives.
    ///
    /// The task ID doubles as the correlation ID.
    #[must_use]
    pub fn to_context(&self) -> AgentContext {
        AgentContext::new(self.data.clone()).with_correlation_id(self.task_id.clone())
    }
}

/// Result of a delegated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult<T = Value> {
    /// Echoes the payload's task ID.
    pub task_id: String,
    /// Outcome.
    pub status: TaskStatus,
    /// Output on success.
    pub data: Option<T>,
    /// Failure detail.
    pub error: Option<AgentError>,
    /// The payload `retry_count` this result answers.
    pub attempt: u32,
    /// Time spent in `run`.
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    /// Translates an agent result into a task result for `payload`.
    #[must_use]
    pub fn from_agent_result(payload: &TaskPayload, result: AgentResult<T>) -> Self {
        let status = if result.success { TaskStatus::Succeeded } else { TaskStatus::Failed };
        Self {
            task_id: payload.task_id.clone(),
            status,
            data: result.data,
            error: result.error,
            attempt: payload.retry_count,
            duration: result.duration,
        }
    }

    /// `true` when the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// `true` when the task failed with a retryable error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.status == TaskStatus::Failed && self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

impl TaskResult<Value> {
    /// Decodes the JSON output into the sub-agent's declared output type.
    pub fn decode<T: DeserializeOwned>(self) -> TaskResult<T> {
        let Self { task_id, status, data, error, attempt, duration } = self;
        let (status, data, error) = match (status, data) {
            (TaskStatus::Succeeded, Some(value)) => match serde_json::from_value(value) {
                Ok(typed) => (TaskStatus::Succeeded, Some(typed), None),
                Err(e) => (
                    TaskStatus::Failed,
                    None,
                    Some(AgentError::validation(
                        "invalid_output",
                        format!("cannot decode task output: {}", e),
                    )),
                ),
            },
            (status, _) => (status, None, error),
        };
        TaskResult { task_id, status, data, error, attempt, duration }
    }
}

/// A sub-agent's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion percentage, 0 to 100.
    pub percent: u8,
    /// Current step label.
    pub step: String,
    /// Free-form message.
    pub message: String,
}

impl Progress {
    /// Creates a progress value; `percent` is capped at 100.
    #[must_use]
    pub fn new(percent: u8, step: impl Into<String>, message: impl Into<String>) -> Self {
        Self { percent: percent.min(100), step: step.into(), message: message.into() }
    }

    /// The value reported while no task is running.
    #[must_use]
    pub fn idle() -> Self {
        Self::new(0, "idle", "")
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::idle()
    }
}

/// Event sent from a sub-agent to its parent.
#[derive(Debug, Clone)]
pub enum ParentEvent {
    /// A task finished successfully.
    TaskCompleted {
        /// Sub-agent ID.
        child_id: String,
        /// The result.
        result: TaskResult<Value>,
    },
    /// The sub-agent reported progress.
    Progress {
        /// Sub-agent ID.
        child_id: String,
        /// Progress snapshot.
        progress: Progress,
    },
    /// A task failed.
    Error {
        /// Sub-agent ID.
        child_id: String,
        /// Failed task.
        task_id: String,
        /// Failure detail.
        error: AgentError,
    },
    /// Free-form upward notification.
    Notification {
        /// Sub-agent ID.
        child_id: String,
        /// Requested priority.
        priority: NotificationPriority,
        /// Title.
        title: String,
        /// Body.
        message: String,
    },
}

impl ParentEvent {
    /// ID of the sub-agent that produced the event.
    pub fn child_id(&self) -> &str {
        match self {
            Self::TaskCompleted { child_id, .. }
            | Self::Progress { child_id, .. }
            | Self::Error { child_id, .. }
            | Self::Notification { child_id, .. } => child_id,
        }
    }
}

/// Sending half of a parent's event channel, held by each child.
#[derive(Debug, Clone)]
pub struct ParentLink {
    parent_id: String,
    sender: mpsc::UnboundedSender<ParentEvent>,
}

impl ParentLink {
    /// Parent agent ID.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Sends an event without waiting. A closed inbox is logged and ignored.
    pub fn send(&self, event: ParentEvent) {
        if self.sender.send(event).is_err() {
            debug!(parent_id = %self.parent_id, "Parent inbox closed, event dropped");
        }
    }
}

/// Receiving half of a parent's event channel.
#[derive(Debug)]
pub struct ParentInbox {
    parent_id: String,
    receiver: mpsc::UnboundedReceiver<ParentEvent>,
}

impl ParentInbox {
    /// Creates the channel for `parent_id`.
    ///
    /// # Returns
    /// The link to clone into each child, and the inbox the parent drains.
    #[must_use]
    pub fn channel(parent_id: impl Into<String>) -> (ParentLink, Self) {
        let parent_id = parent_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        (ParentLink { parent_id: parent_id.clone(), sender }, Self { parent_id, receiver })
    }

    /// Parent agent ID.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Waits for the next event; `None` once every link is dropped.
    pub async fn recv(&mut self) -> Option<ParentEvent> {
        self.receiver.recv().await
    }

    /// Returns every event that is already queued.
    pub fn drain(&mut self) -> Vec<ParentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Handle an agent uses to report progress while running a delegated task.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    child_id: String,
    current: Arc<Mutex<Progress>>,
    parent: Option<ParentLink>,
}

impl ProgressReporter {
    /// Stores the progress and forwards it to the parent.
    pub fn report(&self, progress: Progress) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = progress.clone();
        if let Some(parent) = &self.parent {
            parent.send(ParentEvent::Progress { child_id: self.child_id.clone(), progress });
        }
    }
}

/// Runs one delegated task against `handle`.
///
/// Never fails: every failure path becomes a `Failed` result.
pub async fn execute_task(handle: &AgentHandle, payload: &TaskPayload) -> TaskResult<Value> {
    debug!(
        agent_id = %handle.id(),
        task_id = %payload.task_id,
        attempt = payload.retry_count,
        "Executing task"
    );
    let result = handle.run(payload.to_context()).await;
    TaskResult::from_agent_result(payload, result)
}

/// Runs a task whose terminal failure the caller escalates itself.
pub(crate) async fn execute_task_unescalated(handle: &AgentHandle, payload: &TaskPayload) -> TaskResult<Value> {
    debug!(agent_id = %handle.id(), task_id = %payload.task_id, attempt = payload.retry_count, "Executing task");
    let result = handle.run_unescalated(payload.to_context()).await;
    TaskResult::from_agent_result(payload, result)
}

/// Capability of an agent that accepts delegated tasks.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Runs one task. Never fails; inspect the result status.
    async fn execute_task(&self, payload: &TaskPayload) -> TaskResult<Value>;

    /// Runs one task and decodes its output into `Out`.
    async fn execute_task_as<Out>(&self, payload: &TaskPayload) -> TaskResult<Out>
    where
        Out: DeserializeOwned + Send,
        Self: Sized,
    {
        self.execute_task(payload).await.decode()
    }

    /// Sends a fire-and-forget notification to the parent.
    fn notify_parent(&self, title: &str, message: &str, priority: NotificationPriority);

    /// Current progress, or [`Progress::idle`] when not running.
    fn progress(&self) -> Progress;
}

/// An agent handle composed with the delegate capability.
pub struct SubAgent {
    handle: Arc<AgentHandle>,
    parent: Option<ParentLink>,
    current: Arc<Mutex<Progress>>,
}

impl fmt::Debug for SubAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAgent")
            .field("id", &self.handle.id())
            .field("parent_id", &self.parent.as_ref().map(ParentLink::parent_id))
            .finish_non_exhaustive()
    }
}

impl SubAgent {
    /// Creates a sub-agent reporting to `parent`.
    #[must_use]
    pub fn new(handle: Arc<AgentHandle>, parent: ParentLink) -> Self {
        Self { handle, parent: Some(parent), current: Arc::default() }
    }

    /// Creates a sub-agent with no parent channel.
    #[must_use]
    pub fn detached(handle: Arc<AgentHandle>) -> Self {
        Self { handle, parent: None, current: Arc::default() }
    }

    /// The underlying handle.
    pub fn handle(&self) -> &Arc<AgentHandle> {
        &self.handle
    }

    /// Sub-agent ID.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Parent agent ID, if linked.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_ref().map(ParentLink::parent_id)
    }

    fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            child_id: self.id().to_string(),
            current: Arc::clone(&self.current),
            parent: self.parent.clone(),
        }
    }
}

#[async_trait]
impl Delegate for SubAgent {
    async fn execute_task(&self, payload: &TaskPayload) -> TaskResult<Value> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Progress::idle();

        let context = payload.to_context().with_reporter(self.reporter());
        let result = self.handle.run(context).await;
        let result = TaskResult::from_agent_result(payload, result);

        if let Some(parent) = &self.parent {
            let child_id = self.id().to_string();
            match &result.error {
                None => parent.send(ParentEvent::TaskCompleted { child_id, result: result.clone() }),
                Some(error) => parent.send(ParentEvent::Error {
                    child_id,
                    task_id: result.task_id.clone(),
                    error: error.clone(),
                }),
            }
        }
        result
    }

    fn notify_parent(&self, title: &str, message: &str, priority: NotificationPriority) {
        match &self.parent {
            Some(parent) => parent.send(ParentEvent::Notification {
                child_id: self.id().to_string(),
                priority,
                title: title.to_string(),
                message: message.to_string(),
            }),
            None => debug!(agent_id = %self.id(), title = %title, "No parent to notify"),
        }
    }

    fn progress(&self) -> Progress {
        if self.handle.state() == AgentState::Running {
            self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
        } else {
            Progress::idle()
        }
    }
}

impl RetryPolicy {
    /// Delivers `payload`, re-delivering it after each retryable failure.
    ///
    /// A re-delivery keeps the task ID and bumps `retry_count` by one. Once
    /// `retry_count` reaches `max_retries` the result is terminal.
    pub async fn deliver<T, F, Fut>(&self, payload: TaskPayload, mut attempt: F) -> TaskResult<T>
    where
        F: FnMut(TaskPayload) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let mut payload = payload;
        loop {
            let result = attempt(payload.clone()).await;
            if !result.is_retryable() {
                return result;
            }
            if payload.retry_count >= self.max_retries {
                warn!(
                    task_id = %payload.task_id,
                    retry_count = payload.retry_count,
                    "Task retry budget exhausted"
                );
                return result;
            }
            warn!(
                task_id = %payload.task_id,
                retry_count = payload.retry_count + 1,
                max_retries = self.max_retries,
                "Re-delivering task"
            );
            tokio::time::sleep(self.retry_delay).await;
            payload = payload.redeliver();
        }
    }
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    payload: TaskPayload,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the earlier arrival.
        self.payload
            .priority
            .cmp(&other.payload.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of tasks waiting to be delegated.
///
/// Highest priority dispatches first; equal priorities dispatch in arrival order.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

impl DispatchQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a payload.
    pub fn push(&mut self, payload: TaskPayload) {
        debug!(task_id = %payload.task_id, priority = payload.priority, "Queueing task");
        self.heap.push(Queued { seq: self.next_seq, payload });
        self.next_seq += 1;
    }

    /// Removes the next payload to dispatch.
    pub fn pop(&mut self) -> Option<TaskPayload> {
        self.heap.pop().map(|queued| queued.payload)
    }

    /// The next payload to dispatch, without removing it.
    pub fn peek(&self) -> Option<&TaskPayload> {
        self.heap.peek().map(|queued| &queued.payload)
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Dispatches every queued payload to `delegate` in priority order.
    ///
    /// Each payload is delivered under `policy`.
    pub async fn dispatch_all<D: Delegate>(
        &mut self,
        delegate: &D,
        policy: RetryPolicy,
    ) -> Vec<TaskResult<Value>> {
        let mut results = Vec::with_capacity(self.len());
        while let Some(payload) = self.pop() {
            let result = policy
                .deliver(payload, |p| async move { delegate.execute_task(&p).await })
                .await;
            results.push(result);
        }
        results
    }
}
