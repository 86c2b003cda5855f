//! Supervisor coordination service
//!
//! The coordinator owns the supervisor side of the task lifecycle: it picks
//! an agent for new work, sends the task request, digests the responses and
//! error reports coming back, and spawns replacement attempts when a worker
//! fails or goes silent. Periodic maintenance folds the queue and registry
//! sweeps into a single pass.

use crate::error::{Error, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::services::queue::{AckDisposition, MessageQueue};
use crate::services::registry::{AgentRegistry, RegistryStats};
use crate::store::{CoordinationStore, MessageCounts, TaskCounts};
use chrono::{DateTime, Utc};
use foreman_core::agent::{Agent, AgentRole, AgentStatus};
use foreman_core::config::{CoordinationConfig, SUPERVISOR_CAPABILITIES};
use foreman_core::message::{
    Coordination, ErrorReport, Message, MessagePayload, MessagePriority, ReportedStatus,
    TaskRequest, TaskResponse,
};
use foreman_core::task::{Task, TaskStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Description of a unit of work to delegate
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    /// Free-form inputs, must be a JSON object
    pub parameters: Value,
    pub required_capabilities: Vec<String>,
    pub priority: MessagePriority,
    pub deadline: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            task_type: String::new(),
            description: String::new(),
            parameters: Value::Object(Default::default()),
            required_capabilities: Vec::new(),
            priority: MessagePriority::Medium,
            deadline: None,
            parent_id: None,
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceReport {
    pub reaped_claims: u32,
    pub expired_messages: u32,
    pub retired_agents: u32,
    pub reconciled_tasks: u32,
    pub purged_messages: u64,
    pub purged_tasks: u64,
}

/// Combined system snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationStatistics {
    pub backend: &'static str,
    pub agents: RegistryStats,
    pub messages: MessageCounts,
    pub tasks: TaskCounts,
}

/// Supervisor-side task delegation and response handling
pub struct SupervisorCoordinator {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<AgentRegistry>,
    queue: Arc<MessageQueue>,
    config: CoordinationConfig,
    events: EventBus,
}

impl SupervisorCoordinator {
    /// Create a new coordinator over shared services
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: Arc<AgentRegistry>,
        queue: Arc<MessageQueue>,
        config: CoordinationConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            config,
            events,
        }
    }

    /// Validate the configuration and register the supervisor identity.
    ///
    /// The supervisor registers with zero task capacity so it can send and
    /// receive messages without ever being picked for assignment.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        let supervisor = Agent::builder()
            .id(&self.config.supervisor_id)
            .role(AgentRole::Supervisor)
            .capabilities(SUPERVISOR_CAPABILITIES.iter().copied())
            .max_concurrent_tasks(0)
            .build()?;
        self.registry.register(supervisor).await?;
        info!(
            "Supervisor {} online ({} store)",
            self.config.supervisor_id,
            self.store.backend_name()
        );
        Ok(())
    }

    /// Delegate a unit of work to the least loaded capable agent.
    ///
    /// Returns `Ok(None)` when no live agent offers every required
    /// capability; nothing is created in that case and the caller decides
    /// whether to retry later or report capacity exhaustion. Otherwise the
    /// task is persisted before the request message goes out.
    pub async fn assign_task(&self, spec: TaskSpec) -> Result<Option<Task>> {
        let Some(agent) = self
            .registry
            .find_best(&spec.required_capabilities, &[])
            .await?
        else {
            debug!(
                "No assignable agent offers [{}]",
                spec.required_capabilities.join(", ")
            );
            return Ok(None);
        };

        let mut builder = Task::builder()
            .task_type(&spec.task_type)
            .description(&spec.description)
            .parameters(spec.parameters.clone())
            .required_capabilities(spec.required_capabilities.iter().cloned())
            .supervisor_agent(&self.config.supervisor_id)
            .priority(spec.priority);
        if let Some(deadline) = spec.deadline {
            builder = builder.deadline(deadline);
        }
        if let Some(parent_id) = spec.parent_id {
            builder = builder.parent(parent_id);
        }
        let task = builder.build()?;
        self.store.create_task(&task).await?;

        self.dispatch(task, &agent.id).await.map(Some)
    }

    /// Drain and apply one batch of messages addressed to the supervisor.
    ///
    /// Every claimed message is settled exactly once: applied cleanly it is
    /// acknowledged as processed, otherwise it is failed with the error. A
    /// bad message never blocks the rest of the batch.
    pub async fn process_incoming(&self) -> Result<u32> {
        let batch = self
            .queue
            .receive(&self.config.supervisor_id, self.config.drain_batch_size)
            .await?;
        let mut handled = 0;
        for message in batch {
            let disposition = match self.apply(&message).await {
                Ok(()) => AckDisposition::Processed,
                Err(e) => {
                    warn!(
                        "Message {} from {} not applied: {}",
                        message.id, message.from_agent, e
                    );
                    AckDisposition::Failed {
                        error: e.to_string(),
                    }
                }
            };
            self.queue
                .ack(&self.config.supervisor_id, message.id, disposition)
                .await?;
            handled += 1;
        }
        if handled > 0 {
            debug!("Processed {} inbound messages", handled);
        }
        Ok(handled)
    }

    /// Route one inbound message to its handler
    async fn apply(&self, message: &Message) -> Result<()> {
        match &message.payload {
            MessagePayload::TaskResponse(response) => {
                self.apply_task_response(&message.from_agent, response).await
            }
            MessagePayload::StatusUpdate(update) => {
                self.registry
                    .apply_status_update(&message.from_agent, update)
                    .await?;
                Ok(())
            }
            MessagePayload::Heartbeat(heartbeat) => {
                self.registry
                    .heartbeat(
                        &message.from_agent,
                        Some(heartbeat.status),
                        Some(heartbeat.current_tasks),
                    )
                    .await?;
                Ok(())
            }
            MessagePayload::ErrorReport(report) => {
                self.apply_error_report(&message.from_agent, report).await
            }
            MessagePayload::Coordination(Coordination::CancelTask { task_id }) => {
                match self.cancel_task(*task_id).await {
                    Ok(_) => Ok(()),
                    // A cancel crossing the finish line is not an error
                    Err(e) if e.is_conflict() => {
                        debug!("Cancel request for settled task {} ignored", task_id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            MessagePayload::Coordination(signal) => {
                debug!(
                    "Coordination signal from {}: {:?}",
                    message.from_agent, signal
                );
                Ok(())
            }
            MessagePayload::TaskRequest(_) => {
                warn!(
                    "Task request from {} addressed to the supervisor; ignoring",
                    message.from_agent
                );
                Ok(())
            }
        }
    }

    /// Fold a worker's task report into the stored task
    async fn apply_task_response(&self, from: &str, response: &TaskResponse) -> Result<()> {
        let Some(mut task) = self.store.get_task(response.task_id).await? else {
            return Err(Error::not_found("task", response.task_id.to_string()));
        };
        if task.assigned_agent.as_deref() != Some(from) {
            warn!(
                "Discarding report on task {} from non-assignee {}",
                task.id, from
            );
            return Ok(());
        }
        if task.status.is_terminal() {
            debug!("Report on settled task {} from {} ignored", task.id, from);
            return Ok(());
        }

        match response.status {
            ReportedStatus::InProgress => {
                let expected = task.status;
                if expected == TaskStatus::Assigned {
                    task.transition(TaskStatus::InProgress)?;
                }
                if let Some(progress) = response.progress {
                    task.apply_progress(progress)?;
                }
                if !self.store.update_task(&task, expected).await? {
                    debug!("Progress report on task {} lost a write race", task.id);
                }
                Ok(())
            }
            ReportedStatus::Completed => {
                let expected = task.status;
                task.complete_with(response.result.clone())?;
                if !self.store.update_task(&task, expected).await? {
                    debug!("Completion of task {} lost a write race", task.id);
                    return Ok(());
                }
                self.registry.adjust_load(from, -1).await?;
                info!("Task {} completed by {}", task.id, from);
                self.events
                    .emit(CoordinationEvent::TaskCompleted { task_id: task.id });
                Ok(())
            }
            ReportedStatus::Failed => {
                let reason = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                self.fail_and_reassign(task, from, &reason).await
            }
        }
    }

    /// Fold an out-of-band error report into the referenced task, if any
    async fn apply_error_report(&self, from: &str, report: &ErrorReport) -> Result<()> {
        let Some(task_id) = report.task_id else {
            warn!(
                "Error report from {}: [{}] {}",
                from, report.error_type, report.message
            );
            return Ok(());
        };
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };
        if task.assigned_agent.as_deref() != Some(from) {
            warn!(
                "Discarding error report on task {} from non-assignee {}",
                task_id, from
            );
            return Ok(());
        }
        if task.status.is_terminal() {
            debug!("Error report on settled task {} ignored", task_id);
            return Ok(());
        }

        let annotation = format!("[{}] {}", report.error_type, report.message);
        if report.terminal {
            return self.fail_and_reassign(task, from, &annotation).await;
        }
        let expected = task.status;
        task.record_error(&annotation);
        if !self.store.update_task(&task, expected).await? {
            debug!("Error annotation on task {} lost a write race", task_id);
        }
        Ok(())
    }

    /// Cancel a live task and notify its assignee.
    ///
    /// The cancellation stands even when the notice cannot be queued; a
    /// settled task cannot be cancelled and yields a conflict.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<Task> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(Error::not_found("task", task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {} is already {}",
                task.id, task.status
            )));
        }
        let expected = task.status;
        task.transition(TaskStatus::Cancelled)?;
        if !self.store.update_task(&task, expected).await? {
            return Err(Error::Conflict(format!(
                "task {} changed state during cancellation",
                task.id
            )));
        }

        if let Some(agent_id) = task.assigned_agent.clone() {
            self.registry.adjust_load(&agent_id, -1).await?;
            let notice = Message::builder()
                .from(&self.config.supervisor_id)
                .to(&agent_id)
                .payload(MessagePayload::Coordination(Coordination::CancelTask {
                    task_id,
                }))
                .priority(MessagePriority::High)
                .build()?;
            if let Err(e) = self.queue.send(notice).await {
                warn!(
                    "Cancel notice for task {} to {} not queued: {}",
                    task_id, agent_id, e
                );
            }
        }
        info!("Task {} cancelled", task_id);
        self.events
            .emit(CoordinationEvent::TaskCancelled { task_id });
        Ok(task)
    }

    /// Send a payload to every live agent, returning the broadcast id
    pub async fn broadcast(
        &self,
        payload: MessagePayload,
        priority: MessagePriority,
    ) -> Result<Uuid> {
        let message = Message::builder()
            .from(&self.config.supervisor_id)
            .broadcast()
            .payload(payload)
            .priority(priority)
            .build()?;
        self.queue.send(message).await
    }

    /// Fail live tasks that ran past their deadline, lost their agent, or
    /// stalled without updates, spawning replacement attempts where budget
    /// remains. Returns how many tasks were acted on.
    pub async fn reconcile_timeouts(&self) -> Result<u32> {
        let now = Utc::now();
        let stuck_after =
            chrono::Duration::seconds(self.config.stuck_task_timeout_seconds as i64);
        let stale_after = self.config.stale_agent_timeout_seconds;
        let agents: HashMap<String, Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|agent| (agent.id.clone(), agent))
            .collect();
        let mut reconciled = 0;

        for status in [TaskStatus::Assigned, TaskStatus::InProgress] {
            for task in self.store.list_tasks_with_status(status).await? {
                let Some(agent_id) = task.assigned_agent.clone() else {
                    continue;
                };
                let overdue = task.is_overdue(now);
                let agent_gone = match agents.get(&agent_id) {
                    Some(agent) => {
                        agent.status == AgentStatus::Offline || agent.is_stale(stale_after)
                    }
                    None => true,
                };
                let stalled = task.deadline.is_none()
                    && now.signed_duration_since(task.updated_at) > stuck_after;
                if !overdue && !agent_gone && !stalled {
                    continue;
                }
                let reason = if overdue {
                    "deadline exceeded"
                } else if agent_gone {
                    "assigned agent went silent"
                } else {
                    "no progress within the stuck window"
                };
                self.fail_and_reassign(task, &agent_id, reason).await?;
                reconciled += 1;
            }
        }

        // Pending tasks left behind by an interrupted dispatch fail too
        for mut task in self.store.list_tasks_with_status(TaskStatus::Pending).await? {
            if now.signed_duration_since(task.created_at) <= stuck_after {
                continue;
            }
            task.fail_with("never dispatched")?;
            if self.store.update_task(&task, TaskStatus::Pending).await? {
                warn!("Task {} was never dispatched; failing it", task.id);
                self.events
                    .emit(CoordinationEvent::TaskFailed { task_id: task.id });
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    /// Run one full maintenance pass over messages, agents, and tasks
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        if let Err(e) = self
            .registry
            .heartbeat(&self.config.supervisor_id, None, None)
            .await
        {
            debug!("Supervisor heartbeat skipped: {}", e);
        }
        let reaped_claims = self.queue.reap_timed_out().await?;
        let expired_messages = self.queue.sweep_expired().await?;
        let retired_agents = self.registry.retire_stale().await?.len() as u32;
        let reconciled_tasks = self.reconcile_timeouts().await?;
        let purged_messages = self.queue.purge_resolved().await?;
        let task_cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.retention_seconds as i64);
        let purged_tasks = self.store.purge_tasks(task_cutoff).await?;

        let report = MaintenanceReport {
            reaped_claims,
            expired_messages,
            retired_agents,
            reconciled_tasks,
            purged_messages,
            purged_tasks,
        };
        debug!("Maintenance pass: {:?}", report);
        Ok(report)
    }

    /// Snapshot of agents, messages, and tasks for status reporting
    pub async fn statistics(&self) -> Result<CoordinationStatistics> {
        Ok(CoordinationStatistics {
            backend: self.store.backend_name(),
            agents: self.registry.statistics().await?,
            messages: self.queue.statistics().await?,
            tasks: self.store.task_counts().await?,
        })
    }

    /// Fetch a task by id
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// All tasks currently in `status`
    pub async fn list_tasks(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.store.list_tasks_with_status(status).await
    }

    /// Announce the shutdown to all agents and take the supervisor offline
    pub async fn shutdown(&self) -> Result<()> {
        let counts = self.store.task_counts().await?;
        let active = counts.live() as u32;
        info!(
            "Supervisor {} shutting down with {} live tasks",
            self.config.supervisor_id, active
        );
        let notice = MessagePayload::Coordination(Coordination::SupervisorShutdown {
            supervisor_id: self.config.supervisor_id.clone(),
            active_tasks: active,
        });
        if let Err(e) = self.broadcast(notice, MessagePriority::High).await {
            warn!("Shutdown notice not delivered: {}", e);
        }
        self.registry.set_offline(&self.config.supervisor_id).await
    }

    /// Compose and send the request for `task`, then move it to `Assigned`.
    ///
    /// When the send fails the task is failed in place so it never lingers
    /// as an unassigned pending record.
    async fn dispatch(&self, mut task: Task, agent_id: &str) -> Result<Task> {
        let request = Message::builder()
            .from(&self.config.supervisor_id)
            .to(agent_id)
            .payload(MessagePayload::TaskRequest(TaskRequest {
                task_id: task.id,
                task_type: task.task_type.clone(),
                description: task.description.clone(),
                parameters: task.parameters.clone(),
                required_capabilities: task.required_capabilities.clone(),
                deadline: task.deadline,
            }))
            .priority(task.priority)
            .max_retries(self.config.default_max_retries)
            .build()?;

        match self.queue.send(request).await {
            Ok(_) => {
                task.assign_to(agent_id)?;
                if !self.store.update_task(&task, TaskStatus::Pending).await? {
                    return Err(Error::Conflict(format!(
                        "task {} changed state during assignment",
                        task.id
                    )));
                }
                self.registry.adjust_load(agent_id, 1).await?;
                info!(
                    "Assigned task {} to {} (attempt {})",
                    task.id, agent_id, task.attempt
                );
                self.events.emit(CoordinationEvent::TaskAssigned {
                    task_id: task.id,
                    agent_id: agent_id.to_string(),
                    attempt: task.attempt,
                });
                Ok(task)
            }
            Err(e) => {
                warn!("Dispatch of task {} to {} failed: {}", task.id, agent_id, e);
                task.fail_with(&format!("dispatch failed: {e}"))?;
                self.store.update_task(&task, TaskStatus::Pending).await?;
                Err(e)
            }
        }
    }

    /// Fail a live task on `agent_id` and try to spawn the next attempt
    async fn fail_and_reassign(&self, mut task: Task, agent_id: &str, reason: &str) -> Result<()> {
        let expected = task.status;
        task.fail_with(reason)?;
        if !self.store.update_task(&task, expected).await? {
            debug!("Failure of task {} lost a write race", task.id);
            return Ok(());
        }
        self.registry.adjust_load(agent_id, -1).await?;
        warn!(
            "Task {} failed on {} (attempt {}): {}",
            task.id, agent_id, task.attempt, reason
        );
        self.events
            .emit(CoordinationEvent::TaskFailed { task_id: task.id });

        if let Some(retry) = self.reassign(&task).await? {
            info!(
                "Task {} continues as {} (attempt {})",
                task.id, retry.id, retry.attempt
            );
        }
        Ok(())
    }

    /// Spawn the next attempt of a failed task on a different agent.
    ///
    /// Returns None when the attempt budget is spent or no other agent
    /// qualifies; the failure then stands as final. The retry keeps the
    /// original's deadline budget, measured from now.
    async fn reassign(&self, failed: &Task) -> Result<Option<Task>> {
        if failed.attempt >= self.config.max_task_attempts {
            warn!(
                "Task {} exhausted its {} attempts",
                failed.id, failed.attempt
            );
            return Ok(None);
        }
        let exclude: Vec<String> = failed.assigned_agent.iter().cloned().collect();
        let Some(agent) = self
            .registry
            .find_best(&failed.required_capabilities, &exclude)
            .await?
        else {
            warn!("No alternate agent for task {}; failure stands", failed.id);
            return Ok(None);
        };

        let mut builder = Task::builder()
            .task_type(&failed.task_type)
            .description(&failed.description)
            .parameters(failed.parameters.clone())
            .required_capabilities(failed.required_capabilities.iter().cloned())
            .supervisor_agent(&failed.supervisor_agent)
            .priority(failed.priority)
            .retry_of(failed);
        if let Some(parent_id) = failed.parent_id {
            builder = builder.parent(parent_id);
        }
        if let Some(budget) = failed.deadline_budget() {
            builder = builder.deadline(Utc::now() + budget);
        }
        let retry = builder.build()?;
        self.store.create_task(&retry).await?;

        let dispatched = self.dispatch(retry, &agent.id).await?;
        self.events.emit(CoordinationEvent::TaskReassigned {
            task_id: failed.id,
            retry_task_id: dispatched.id,
            agent_id: agent.id.clone(),
            attempt: dispatched.attempt,
        });
        Ok(Some(dispatched))
    }
}
