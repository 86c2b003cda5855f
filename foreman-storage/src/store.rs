//! Store contract for coordination state
//!
//! [`CoordinationStore`] is the persistence seam shared by the registry,
//! queue, and coordinator services. Every mutation that can race between
//! concurrent callers is expressed as a compare-and-swap: the store applies
//! the change only if the record is still in the expected state and reports
//! back whether it won. Services never hold locks across awaits; they rely
//! on these conditional updates for correctness.
//!
//! [`open_store`] selects the SQLite backend and falls back to the
//! in-memory backend when the database cannot be opened, so coordination
//! stays functional (without durability) on storage failure.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::agent::{Agent, AgentStatus};
use foreman_core::message::{Message, MessageStatus};
use foreman_core::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Store connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// SQLite database URL, e.g. `sqlite:foreman.db`
    pub database_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Whether to create missing tables on connect
    pub migrate_on_startup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:foreman.db".to_string(),
            max_connections: 5,
            migrate_on_startup: true,
        }
    }
}

/// What to do with a claim whose visibility window has lapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRelease {
    /// Return the message to the pending queue, consuming one retry
    Requeue,
    /// Mark the message failed, its retry budget is exhausted
    Fail,
}

/// Message totals broken down by delivery state
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MessageCounts {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub expired: u64,
}

impl MessageCounts {
    /// Total messages across all states
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.processed + self.failed + self.expired
    }
}

/// Task totals broken down by lifecycle state
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: u64,
    pub assigned: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    /// Total tasks across all states
    pub fn total(&self) -> u64 {
        self.live() + self.completed + self.failed + self.cancelled
    }

    /// Tasks that have not reached a terminal state
    pub fn live(&self) -> u64 {
        self.pending + self.assigned + self.in_progress
    }
}

/// Persistence contract for agents, messages, and tasks.
///
/// Methods returning `Result<bool>` are compare-and-swap operations:
/// `Ok(false)` means the guarded condition no longer held and nothing was
/// changed, which callers treat as losing a race, not as a failure.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // --- agents ---

    /// Insert or update an agent record, preserving `registered_at` on
    /// re-registration
    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;

    /// Fetch an agent by id
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;

    /// List all known agents
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    /// Refresh an agent's heartbeat, optionally updating status and task
    /// count; returns false for an unknown agent
    async fn record_heartbeat(
        &self,
        id: &str,
        status: Option<AgentStatus>,
        current_tasks: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Overwrite an agent's status; returns false for an unknown agent
    async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically shift an agent's task count by `delta` (floored at zero)
    /// and recompute its load factor; returns false for an unknown agent
    async fn adjust_agent_load(&self, id: &str, delta: i32, at: DateTime<Utc>) -> Result<bool>;

    // --- messages ---

    /// Persist a new message
    async fn create_message(&self, message: &Message) -> Result<()>;

    /// Persist a batch of messages, all or nothing
    async fn create_messages(&self, messages: &[Message]) -> Result<()>;

    /// Fetch a message by id
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Pending messages addressed to `agent_id`, most urgent first and
    /// oldest first within a priority
    async fn list_pending_for(&self, agent_id: &str, limit: u32) -> Result<Vec<Message>>;

    /// Claim a pending message for exclusive processing; false if the
    /// message is no longer pending
    async fn claim_message(&self, id: Uuid, agent_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Settle a processing message as `Processed` or `Failed`; false unless
    /// the message is processing and held by `agent_id`
    async fn resolve_message(
        &self,
        id: Uuid,
        agent_id: &str,
        outcome: MessageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release a lapsed claim, guarded on the retry count observed by the
    /// caller so concurrent reapers cannot double-count a retry
    async fn release_claim(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        release: ClaimRelease,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a pending message to `Expired`; false if it is not pending
    async fn expire_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Processing messages claimed at or before `cutoff`
    async fn list_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Pending messages whose `expires_at` has passed
    async fn list_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Message totals per delivery state
    async fn message_counts(&self) -> Result<MessageCounts>;

    /// Delete terminal messages settled before `cutoff`, returning how many
    /// were removed
    async fn purge_messages(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // --- tasks ---

    /// Persist a new task
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Fetch a task by id
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// All tasks currently in `status`, oldest update first
    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Overwrite a task record only if it is still in `expected` state
    async fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<bool>;

    /// Task totals per lifecycle state
    async fn task_counts(&self) -> Result<TaskCounts>;

    /// Delete terminal tasks settled before `cutoff`, returning how many
    /// were removed
    async fn purge_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // --- operational ---

    /// Verify the backend is reachable
    async fn health_check(&self) -> Result<()>;

    /// Short backend identifier for logs and statistics
    fn backend_name(&self) -> &'static str;
}

/// Open the configured store, falling back to volatile in-memory state
/// when the database cannot be reached.
///
/// The fallback keeps coordination available at the cost of durability;
/// the degradation is logged loudly rather than surfaced as an error.
pub async fn open_store(config: &StoreConfig) -> Arc<dyn CoordinationStore> {
    match crate::sqlite::SqliteStore::connect(config).await {
        Ok(store) => {
            info!(url = %config.database_url, "sqlite coordination store ready");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                error = %e,
                url = %config.database_url,
                "sqlite store unavailable, continuing with volatile in-memory state"
            );
            Arc::new(crate::memory::MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.database_url, "sqlite:foreman.db");
        assert_eq!(config.max_connections, 5);
        assert!(config.migrate_on_startup);
    }

    #[test]
    fn test_count_totals() {
        let counts = MessageCounts {
            pending: 2,
            processing: 1,
            processed: 5,
            failed: 1,
            expired: 1,
        };
        assert_eq!(counts.total(), 10);

        let counts = TaskCounts {
            pending: 1,
            assigned: 2,
            in_progress: 3,
            completed: 4,
            failed: 0,
            cancelled: 1,
        };
        assert_eq!(counts.live(), 6);
        assert_eq!(counts.total(), 11);
    }

    #[tokio::test]
    async fn test_open_store_falls_back_to_memory() {
        // /dev/null cannot be a parent directory, so the sqlite open fails
        let config = StoreConfig {
            database_url: "sqlite:/dev/null/foreman.db".to_string(),
            ..StoreConfig::default()
        };
        let store = open_store(&config).await;
        assert_eq!(store.backend_name(), "memory");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_store_uses_sqlite_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_url: format!("sqlite:{}/foreman.db", dir.path().display()),
            ..StoreConfig::default()
        };
        let store = open_store(&config).await;
        assert_eq!(store.backend_name(), "sqlite");
        store.health_check().await.unwrap();
    }
}
