//! Task domain model and lifecycle state machine
//!
//! A task is a unit of delegated work with its own lifecycle, distinct
//! from any single message that carries it. Status moves strictly forward
//! (`Pending → Assigned → InProgress → Completed/Failed`), with
//! `Cancelled` reachable from any non-terminal state. Timeout reassignment
//! never rewinds a record: it creates a new attempt linked through
//! `retry_of` while the stale record is failed.
//!
//! # Examples
//!
//! ```rust
//! use foreman_core::task::*;
//! use serde_json::json;
//!
//! let mut task = Task::builder()
//!     .task_type("code_review")
//!     .description("Review the queue claim path")
//!     .parameters(json!({"pull_request": 17}))
//!     .supervisor_agent("supervisor-main")
//!     .build()
//!     .unwrap();
//!
//! task.assign_to("review-worker-1").unwrap();
//! assert_eq!(task.status, TaskStatus::Assigned);
//! assert!(task.assigned_at.is_some());
//! ```

use crate::message::MessagePriority;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this state accepts no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned | Failed | Cancelled)
                | (Assigned, InProgress | Completed | Failed | Cancelled)
                | (InProgress, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::decode(format!("unknown task status: {other}"))),
        }
    }
}

/// A unit of delegated work tracked by a supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    /// Subtask linkage to a parent unit of work
    pub parent_id: Option<Uuid>,
    pub task_type: String,
    pub description: String,
    pub parameters: Value,
    pub required_capabilities: Vec<String>,
    pub assigned_agent: Option<String>,
    pub supervisor_agent: String,
    pub priority: MessagePriority,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    /// Assignment generation, starting at 1 for the original attempt
    pub attempt: u32,
    /// Link to the failed prior attempt this task retries
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task with validation
    pub fn new(
        task_type: String,
        description: String,
        parameters: Value,
        supervisor_agent: String,
    ) -> Result<Self> {
        Self::validate_task_type(&task_type)?;
        Self::validate_description(&description)?;
        if !parameters.is_object() {
            return Err(Error::validation("Task parameters must be a JSON object"));
        }
        crate::agent::Agent::validate_id(&supervisor_agent)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            parent_id: None,
            task_type,
            description,
            parameters,
            required_capabilities: Vec::new(),
            assigned_agent: None,
            supervisor_agent,
            priority: MessagePriority::default(),
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error_message: None,
            deadline: None,
            attempt: 1,
            retry_of: None,
            created_at: now,
            assigned_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    /// Create a builder for constructing a Task
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    fn validate_task_type(task_type: &str) -> Result<()> {
        if task_type.trim().is_empty() {
            return Err(Error::validation("Task type cannot be empty"));
        }
        if task_type.len() > 100 {
            return Err(Error::validation("Task type cannot exceed 100 characters"));
        }
        Ok(())
    }

    fn validate_description(description: &str) -> Result<()> {
        if description.trim().is_empty() {
            return Err(Error::validation("Task description cannot be empty"));
        }
        if description.len() > 10000 {
            return Err(Error::validation(
                "Task description cannot exceed 10000 characters",
            ));
        }
        Ok(())
    }

    /// Move the task to `next`, enforcing the state machine
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        let now = Utc::now();
        self.updated_at = now;
        if next == TaskStatus::Assigned {
            self.assigned_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Assign the task to an agent
    pub fn assign_to<S: Into<String>>(&mut self, agent_id: S) -> Result<()> {
        self.assigned_agent = Some(agent_id.into());
        self.transition(TaskStatus::Assigned)
    }

    /// Apply a reported progress value.
    ///
    /// Progress is non-decreasing while the task is live; a lower or equal
    /// report is ignored, which keeps duplicate deliveries idempotent.
    pub fn apply_progress(&mut self, progress: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(Error::validation("Progress must be within [0, 1]"));
        }
        if self.status.is_terminal() {
            return Err(Error::state_transition(format!(
                "task {} is terminal and no longer accepts progress",
                self.id
            )));
        }
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Complete the task with an optional result payload
    pub fn complete_with(&mut self, result: Option<Value>) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 1.0;
        self.result = result;
        Ok(())
    }

    /// Fail the task, recording the reason
    pub fn fail_with(&mut self, error: &str) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.record_error(error);
        Ok(())
    }

    /// Append a line to the accumulated error log
    pub fn record_error(&mut self, error: &str) {
        match &mut self.error_message {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(error);
            }
            None => self.error_message = Some(error.to_string()),
        }
        self.updated_at = Utc::now();
    }

    /// Whether the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a live task has outlived its deadline
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Deadline budget granted at creation, if any
    pub fn deadline_budget(&self) -> Option<chrono::Duration> {
        self.deadline
            .map(|deadline| deadline.signed_duration_since(self.created_at))
    }
}

/// Builder for constructing Task instances with validation
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    task_type: Option<String>,
    description: Option<String>,
    parameters: Option<Value>,
    required_capabilities: Vec<String>,
    supervisor_agent: Option<String>,
    priority: MessagePriority,
    deadline: Option<DateTime<Utc>>,
    parent_id: Option<Uuid>,
    attempt: Option<u32>,
    retry_of: Option<Uuid>,
}

impl TaskBuilder {
    /// Create a new task builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task type
    pub fn task_type<S: Into<String>>(mut self, task_type: S) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Set the human-readable description
    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the input parameters (must be a JSON object)
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Add a required capability
    pub fn required_capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Add multiple required capabilities
    pub fn required_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(|c| c.into()));
        self
    }

    /// Set the supervising agent
    pub fn supervisor_agent<S: Into<String>>(mut self, supervisor: S) -> Self {
        self.supervisor_agent = Some(supervisor.into());
        self
    }

    /// Set the priority (defaults to `Medium`)
    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the completion deadline
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Link to a parent task
    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Mark this task as the next attempt of a failed one
    pub fn retry_of(mut self, prior: &Task) -> Self {
        self.retry_of = Some(prior.id);
        self.attempt = Some(prior.attempt + 1);
        self
    }

    /// Build the Task instance
    pub fn build(self) -> Result<Task> {
        let task_type = self
            .task_type
            .ok_or_else(|| Error::validation("Task type is required"))?;
        let description = self
            .description
            .ok_or_else(|| Error::validation("Task description is required"))?;
        let parameters = self.parameters.unwrap_or_else(|| Value::Object(Default::default()));
        let supervisor = self
            .supervisor_agent
            .ok_or_else(|| Error::validation("Task supervisor_agent is required"))?;

        if self.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::validation("Required capabilities cannot be empty"));
        }

        let mut task = Task::new(task_type, description, parameters, supervisor)?;
        task.required_capabilities = self.required_capabilities;
        task.priority = self.priority;
        task.deadline = self.deadline;
        task.parent_id = self.parent_id;
        task.retry_of = self.retry_of;
        if let Some(attempt) = self.attempt {
            task.attempt = attempt;
        }
        Ok(task)
    }
}
