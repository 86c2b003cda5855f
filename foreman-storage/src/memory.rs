//! Volatile in-memory store backend
//!
//! Drop-in fallback for the SQLite backend with the same compare-and-swap
//! semantics, guarded by a single async lock. State lives only as long as
//! the process; [`crate::store::open_store`] selects it when the database
//! cannot be opened, and tests use it to exercise service logic without
//! touching disk.

use crate::store::{ClaimRelease, CoordinationStore, MessageCounts, TaskCounts};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::agent::{Agent, AgentStatus};
use foreman_core::message::{Message, MessageStatus};
use foreman_core::task::{Task, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    agents: HashMap<String, Agent>,
    messages: HashMap<Uuid, Message>,
    tasks: HashMap<Uuid, Task>,
}

/// In-memory implementation of [`CoordinationStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.state.write().await;
        let mut record = agent.clone();
        if let Some(existing) = state.agents.get(&agent.id) {
            record.registered_at = existing.registered_at;
        }
        state.agents.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let state = self.state.read().await;
        Ok(state.agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        status: Option<AgentStatus>,
        current_tasks: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.agents.get_mut(id) {
            Some(agent) => {
                agent.last_heartbeat = at;
                if let Some(status) = status {
                    agent.status = status;
                }
                if let Some(current_tasks) = current_tasks {
                    agent.current_tasks = current_tasks;
                }
                agent.recalculate_load();
                agent.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.agents.get_mut(id) {
            Some(agent) => {
                agent.status = status;
                agent.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn adjust_agent_load(&self, id: &str, delta: i32, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.agents.get_mut(id) {
            Some(agent) => {
                agent.current_tasks = if delta >= 0 {
                    agent.current_tasks.saturating_add(delta as u32)
                } else {
                    agent.current_tasks.saturating_sub(delta.unsigned_abs())
                };
                agent.recalculate_load();
                agent.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_message(&self, message: &Message) -> Result<()> {
        let mut state = self.state.write().await;
        if state.messages.contains_key(&message.id) {
            return Err(Error::Conflict(format!(
                "message {} already exists",
                message.id
            )));
        }
        state.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn create_messages(&self, messages: &[Message]) -> Result<()> {
        let mut state = self.state.write().await;
        for message in messages {
            if state.messages.contains_key(&message.id) {
                return Err(Error::Conflict(format!(
                    "message {} already exists",
                    message.id
                )));
            }
        }
        for message in messages {
            state.messages.insert(message.id, message.clone());
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id).cloned())
    }

    async fn list_pending_for(&self, agent_id: &str, limit: u32) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut pending: Vec<Message> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Pending
                    && m.to_agent.as_deref() == Some(agent_id)
                    && m.has_retry_budget()
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn claim_message(&self, id: Uuid, agent_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Processing;
                message.claimed_by = Some(agent_id.to_string());
                message.claimed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resolve_message(
        &self,
        id: Uuid,
        agent_id: &str,
        outcome: MessageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&id) {
            Some(message)
                if message.status == MessageStatus::Processing
                    && message.claimed_by.as_deref() == Some(agent_id) =>
            {
                message.status = outcome;
                message.processed_at = Some(at);
                if let Some(error) = error {
                    message.error_message = Some(error.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        release: ClaimRelease,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&id) {
            Some(message)
                if message.status == MessageStatus::Processing
                    && message.retry_count == expected_retry_count =>
            {
                message.retry_count += 1;
                if let Some(error) = error {
                    message.error_message = Some(error.to_string());
                }
                match release {
                    ClaimRelease::Requeue => {
                        message.status = MessageStatus::Pending;
                        message.claimed_by = None;
                        message.claimed_at = None;
                    }
                    ClaimRelease::Fail => {
                        message.status = MessageStatus::Failed;
                        message.processed_at = Some(at);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Expired;
                message.processed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut claimed: Vec<Message> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.claimed_at.is_some_and(|claimed_at| claimed_at <= cutoff)
            })
            .cloned()
            .collect();
        claimed.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn list_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut expired: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(expired)
    }

    async fn message_counts(&self) -> Result<MessageCounts> {
        let state = self.state.read().await;
        let mut counts = MessageCounts::default();
        for message in state.messages.values() {
            match message.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Processing => counts.processing += 1,
                MessageStatus::Processed => counts.processed += 1,
                MessageStatus::Failed => counts.failed += 1,
                MessageStatus::Expired => counts.expired += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_messages(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.messages.len();
        state.messages.retain(|_, m| {
            !(m.status.is_terminal() && m.processed_at.unwrap_or(m.created_at) < cutoff)
        });
        Ok((before - state.messages.len()) as u64)
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(Error::Conflict(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task.id) {
            Some(existing) if existing.status == expected => {
                let mut record = task.clone();
                record.created_at = existing.created_at;
                *existing = record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn task_counts(&self) -> Result<TaskCounts> {
        let state = self.state.read().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.unwrap_or(t.updated_at) < cutoff)
        });
        Ok((before - state.tasks.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
