//! SQLite store backend
//!
//! Durable implementation of [`CoordinationStore`] backed by a WAL-mode
//! SQLite database. All identifiers and timestamps are stored as TEXT
//! (UUIDs and RFC 3339), JSON blobs hold payloads and capability lists,
//! and every racy transition is a conditional UPDATE judged by
//! `rows_affected`, so correctness does not depend on table locks held
//! across awaits.

use crate::store::{ClaimRelease, CoordinationStore, MessageCounts, StoreConfig, TaskCounts};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::agent::{Agent, AgentRole, AgentStatus};
use foreman_core::message::{Message, MessagePriority, MessageStatus};
use foreman_core::task::{Task, TaskStatus};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const AGENT_COLUMNS: &str = "id, role, capabilities, status, max_concurrent_tasks, \
     current_tasks, load_factor, last_heartbeat, registered_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, from_agent, to_agent, payload, priority, parent_id, \
     broadcast_id, status, retry_count, max_retries, created_at, expires_at, claimed_by, \
     claimed_at, processed_at, error_message";

const TASK_COLUMNS: &str = "id, parent_id, task_type, description, parameters, \
     required_capabilities, assigned_agent, supervisor_agent, priority, status, progress, \
     result, error_message, deadline, attempt, retry_of, created_at, assigned_at, \
     completed_at, updated_at";

/// SQLite-backed implementation of [`CoordinationStore`]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open the database named by `config`, creating the file and parent
    /// directory as needed
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        ensure_parent_directory(&config.database_url)?;

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(Error::Database)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        if config.migrate_on_startup {
            store.run_migrations().await?;
        }
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running coordination schema setup");
        self.create_agents_table().await?;
        self.create_messages_table().await?;
        self.create_tasks_table().await?;
        info!("Coordination schema ready");
        Ok(())
    }

    async fn create_agents_table(&self) -> Result<()> {
        debug!("Creating agents table");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL CHECK (role IN ('supervisor', 'worker', 'coordinator')),
                capabilities TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('active', 'idle', 'busy', 'offline', 'error')),
                max_concurrent_tasks INTEGER NOT NULL,
                current_tasks INTEGER NOT NULL DEFAULT 0,
                load_factor REAL NOT NULL DEFAULT 0.0,
                last_heartbeat TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_agents_status ON agents (status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_messages_table(&self) -> Result<()> {
        debug!("Creating messages table");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                to_agent TEXT,
                message_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 5),
                parent_id TEXT,
                broadcast_id TEXT,
                status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'processed', 'failed', 'expired')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                claimed_by TEXT,
                claimed_at TEXT,
                processed_at TEXT,
                error_message TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_inbox \
             ON messages (to_agent, status, priority, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_claims ON messages (status, claimed_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_expiry ON messages (status, expires_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_tasks_table(&self) -> Result<()> {
        debug!("Creating tasks table");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                task_type TEXT NOT NULL,
                description TEXT NOT NULL,
                parameters TEXT NOT NULL,
                required_capabilities TEXT NOT NULL,
                assigned_agent TEXT,
                supervisor_agent TEXT NOT NULL,
                priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 5),
                status TEXT NOT NULL CHECK (status IN ('pending', 'assigned', 'in_progress', 'completed', 'failed', 'cancelled')),
                progress REAL NOT NULL DEFAULT 0.0,
                result TEXT,
                error_message TEXT,
                deadline TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                retry_of TEXT,
                created_at TEXT NOT NULL,
                assigned_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, updated_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks (assigned_agent)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn ensure_parent_directory(database_url: &str) -> Result<()> {
    let clean_path = database_url
        .strip_prefix("sqlite:")
        .unwrap_or(database_url);
    if clean_path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(clean_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Unavailable(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(anyhow::anyhow!("invalid stored timestamp {value:?}: {e}")))
}

fn parse_opt_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_timestamp).transpose()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("invalid stored id {value:?}: {e}")))
}

fn parse_opt_uuid(value: Option<&str>) -> Result<Option<Uuid>> {
    value.map(parse_uuid).transpose()
}

fn map_insert_error(entity: &'static str, id: String) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{entity} {id} already exists"))
        }
        _ => Error::Database(e),
    }
}

#[derive(Debug, FromRow)]
struct AgentRow {
    id: String,
    role: String,
    capabilities: String,
    status: String,
    max_concurrent_tasks: i64,
    current_tasks: i64,
    load_factor: f64,
    last_heartbeat: String,
    registered_at: String,
    updated_at: String,
}

impl AgentRow {
    fn into_agent(self) -> Result<Agent> {
        Ok(Agent {
            id: self.id,
            role: self.role.parse::<AgentRole>()?,
            capabilities: serde_json::from_str(&self.capabilities)?,
            status: self.status.parse::<AgentStatus>()?,
            max_concurrent_tasks: self.max_concurrent_tasks as u32,
            current_tasks: self.current_tasks as u32,
            load_factor: self.load_factor,
            last_heartbeat: parse_timestamp(&self.last_heartbeat)?,
            registered_at: parse_timestamp(&self.registered_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    from_agent: String,
    to_agent: Option<String>,
    payload: String,
    priority: i64,
    parent_id: Option<String>,
    broadcast_id: Option<String>,
    status: String,
    retry_count: i64,
    max_retries: i64,
    created_at: String,
    expires_at: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
    processed_at: Option<String>,
    error_message: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            from_agent: self.from_agent,
            to_agent: self.to_agent,
            payload: serde_json::from_str(&self.payload)?,
            priority: MessagePriority::try_from(self.priority as u8)?,
            parent_id: parse_opt_uuid(self.parent_id.as_deref())?,
            broadcast_id: parse_opt_uuid(self.broadcast_id.as_deref())?,
            status: self.status.parse::<MessageStatus>()?,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            created_at: parse_timestamp(&self.created_at)?,
            expires_at: parse_opt_timestamp(self.expires_at.as_deref())?,
            claimed_by: self.claimed_by,
            claimed_at: parse_opt_timestamp(self.claimed_at.as_deref())?,
            processed_at: parse_opt_timestamp(self.processed_at.as_deref())?,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    parent_id: Option<String>,
    task_type: String,
    description: String,
    parameters: String,
    required_capabilities: String,
    assigned_agent: Option<String>,
    supervisor_agent: String,
    priority: i64,
    status: String,
    progress: f64,
    result: Option<String>,
    error_message: Option<String>,
    deadline: Option<String>,
    attempt: i64,
    retry_of: Option<String>,
    created_at: String,
    assigned_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            parent_id: parse_opt_uuid(self.parent_id.as_deref())?,
            task_type: self.task_type,
            description: self.description,
            parameters: serde_json::from_str(&self.parameters)?,
            required_capabilities: serde_json::from_str(&self.required_capabilities)?,
            assigned_agent: self.assigned_agent,
            supervisor_agent: self.supervisor_agent,
            priority: MessagePriority::try_from(self.priority as u8)?,
            status: self.status.parse::<TaskStatus>()?,
            progress: self.progress,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error_message: self.error_message,
            deadline: parse_opt_timestamp(self.deadline.as_deref())?,
            attempt: self.attempt as u32,
            retry_of: parse_opt_uuid(self.retry_of.as_deref())?,
            created_at: parse_timestamp(&self.created_at)?,
            assigned_at: parse_opt_timestamp(self.assigned_at.as_deref())?,
            completed_at: parse_opt_timestamp(self.completed_at.as_deref())?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn insert_message_query(message: &Message) -> Result<sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>>> {
    let payload = serde_json::to_string(&message.payload)?;
    Ok(sqlx::query(
        r#"
        INSERT INTO messages (id, from_agent, to_agent, message_type, payload, priority,
            parent_id, broadcast_id, status, retry_count, max_retries, created_at,
            expires_at, claimed_by, claimed_at, processed_at, error_message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
    "#,
    )
    .bind(message.id.to_string())
    .bind(&message.from_agent)
    .bind(message.to_agent.as_deref())
    .bind(message.message_type().as_str())
    .bind(payload)
    .bind(message.priority.value() as i64)
    .bind(message.parent_id.map(|id| id.to_string()))
    .bind(message.broadcast_id.map(|id| id.to_string()))
    .bind(message.status.as_str())
    .bind(message.retry_count as i64)
    .bind(message.max_retries as i64)
    .bind(message.created_at.to_rfc3339())
    .bind(message.expires_at.map(|t| t.to_rfc3339()))
    .bind(message.claimed_by.as_deref())
    .bind(message.claimed_at.map(|t| t.to_rfc3339()))
    .bind(message.processed_at.map(|t| t.to_rfc3339()))
    .bind(message.error_message.as_deref()))
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        debug!("Upserting agent {}", agent.id);
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        // registered_at is deliberately absent from the conflict update so
        // re-registration keeps the original registration time
        sqlx::query(
            r#"
            INSERT INTO agents (id, role, capabilities, status, max_concurrent_tasks,
                current_tasks, load_factor, last_heartbeat, registered_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                capabilities = excluded.capabilities,
                status = excluded.status,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                current_tasks = excluded.current_tasks,
                load_factor = excluded.load_factor,
                last_heartbeat = excluded.last_heartbeat,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&agent.id)
        .bind(agent.role.as_str())
        .bind(capabilities)
        .bind(agent.status.as_str())
        .bind(agent.max_concurrent_tasks as i64)
        .bind(agent.current_tasks as i64)
        .bind(agent.load_factor)
        .bind(agent.last_heartbeat.to_rfc3339())
        .bind(agent.registered_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1");
        let row = sqlx::query_as::<_, AgentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(AgentRow::into_agent).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id ASC");
        let rows = sqlx::query_as::<_, AgentRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AgentRow::into_agent).collect()
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        status: Option<AgentStatus>,
        current_tasks: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET last_heartbeat = ?1,
                status = COALESCE(?2, status),
                current_tasks = COALESCE(?3, current_tasks),
                load_factor = CASE
                    WHEN max_concurrent_tasks = 0 THEN
                        CASE WHEN COALESCE(?3, current_tasks) > 0 THEN 1.0 ELSE 0.0 END
                    ELSE
                        MIN(1.0, CAST(COALESCE(?3, current_tasks) AS REAL) / max_concurrent_tasks)
                END,
                updated_at = ?1
            WHERE id = ?4
        "#,
        )
        .bind(at.to_rfc3339())
        .bind(status.map(|s| s.as_str()))
        .bind(current_tasks.map(|c| c as i64))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn adjust_agent_load(&self, id: &str, delta: i32, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET current_tasks = MAX(0, current_tasks + ?1),
                load_factor = CASE
                    WHEN max_concurrent_tasks = 0 THEN
                        CASE WHEN MAX(0, current_tasks + ?1) > 0 THEN 1.0 ELSE 0.0 END
                    ELSE
                        MIN(1.0, CAST(MAX(0, current_tasks + ?1) AS REAL) / max_concurrent_tasks)
                END,
                updated_at = ?2
            WHERE id = ?3
        "#,
        )
        .bind(delta as i64)
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_message(&self, message: &Message) -> Result<()> {
        debug!("Creating message {} ({})", message.id, message.message_type());
        insert_message_query(message)?
            .execute(&self.pool)
            .await
            .map_err(map_insert_error("message", message.id.to_string()))?;
        Ok(())
    }

    async fn create_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        debug!("Creating batch of {} messages", messages.len());
        let mut tx = self.pool.begin().await?;
        for message in messages {
            insert_message_query(message)?
                .execute(&mut *tx)
                .await
                .map_err(map_insert_error("message", message.id.to_string()))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(MessageRow::into_message).transpose()
    }

    async fn list_pending_for(&self, agent_id: &str, limit: u32) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'pending' AND to_agent = ?1 AND retry_count < max_retries \
             ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(agent_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn claim_message(&self, id: Uuid, agent_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'processing', claimed_by = ?1, claimed_at = ?2
            WHERE id = ?3 AND status = 'pending'
        "#,
        )
        .bind(agent_id)
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resolve_message(
        &self,
        id: Uuid,
        agent_id: &str,
        outcome: MessageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = ?1, processed_at = ?2, error_message = COALESCE(?3, error_message)
            WHERE id = ?4 AND status = 'processing' AND claimed_by = ?5
        "#,
        )
        .bind(outcome.as_str())
        .bind(at.to_rfc3339())
        .bind(error)
        .bind(id.to_string())
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_claim(
        &self,
        id: Uuid,
        expected_retry_count: u32,
        release: ClaimRelease,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match release {
            ClaimRelease::Requeue => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET status = 'pending', retry_count = retry_count + 1,
                        claimed_by = NULL, claimed_at = NULL,
                        error_message = COALESCE(?1, error_message)
                    WHERE id = ?2 AND status = 'processing' AND retry_count = ?3
                "#,
                )
                .bind(error)
                .bind(id.to_string())
                .bind(expected_retry_count as i64)
                .execute(&self.pool)
                .await?
            }
            ClaimRelease::Fail => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET status = 'failed', retry_count = retry_count + 1, processed_at = ?1,
                        error_message = COALESCE(?2, error_message)
                    WHERE id = ?3 AND status = 'processing' AND retry_count = ?4
                "#,
                )
                .bind(at.to_rfc3339())
                .bind(error)
                .bind(id.to_string())
                .bind(expected_retry_count as i64)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn expire_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'expired', processed_at = ?1
            WHERE id = ?2 AND status = 'pending'
        "#,
        )
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'processing' AND claimed_at <= ?1 \
             ORDER BY claimed_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(cutoff.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn list_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn message_counts(&self) -> Result<MessageCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM messages GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = MessageCounts::default();
        for (status, count) in rows {
            match status.parse::<MessageStatus>()? {
                MessageStatus::Pending => counts.pending = count as u64,
                MessageStatus::Processing => counts.processing = count as u64,
                MessageStatus::Processed => counts.processed = count as u64,
                MessageStatus::Failed => counts.failed = count as u64,
                MessageStatus::Expired => counts.expired = count as u64,
            }
        }
        Ok(counts)
    }

    async fn purge_messages(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE status IN ('processed', 'failed', 'expired')
              AND COALESCE(processed_at, created_at) < ?1
        "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        debug!("Creating task {} ({})", task.id, task.task_type);
        let parameters = serde_json::to_string(&task.parameters)?;
        let capabilities = serde_json::to_string(&task.required_capabilities)?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, parent_id, task_type, description, parameters,
                required_capabilities, assigned_agent, supervisor_agent, priority, status,
                progress, result, error_message, deadline, attempt, retry_of, created_at,
                assigned_at, completed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20)
        "#,
        )
        .bind(task.id.to_string())
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.task_type)
        .bind(&task.description)
        .bind(parameters)
        .bind(capabilities)
        .bind(task.assigned_agent.as_deref())
        .bind(&task.supervisor_agent)
        .bind(task.priority.value() as i64)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(result)
        .bind(task.error_message.as_deref())
        .bind(task.deadline.map(|t| t.to_rfc3339()))
        .bind(task.attempt as i64)
        .bind(task.retry_of.map(|id| id.to_string()))
        .bind(task.created_at.to_rfc3339())
        .bind(task.assigned_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_insert_error("task", task.id.to_string()))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
             ORDER BY updated_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let parameters = serde_json::to_string(&task.parameters)?;
        let capabilities = serde_json::to_string(&task.required_capabilities)?;
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        // created_at is immutable; everything else follows the caller's copy
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET parent_id = ?1, task_type = ?2, description = ?3, parameters = ?4,
                required_capabilities = ?5, assigned_agent = ?6, supervisor_agent = ?7,
                priority = ?8, status = ?9, progress = ?10, result = ?11,
                error_message = ?12, deadline = ?13, attempt = ?14, retry_of = ?15,
                assigned_at = ?16, completed_at = ?17, updated_at = ?18
            WHERE id = ?19 AND status = ?20
        "#,
        )
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.task_type)
        .bind(&task.description)
        .bind(parameters)
        .bind(capabilities)
        .bind(task.assigned_agent.as_deref())
        .bind(&task.supervisor_agent)
        .bind(task.priority.value() as i64)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(result_json)
        .bind(task.error_message.as_deref())
        .bind(task.deadline.map(|t| t.to_rfc3339()))
        .bind(task.attempt as i64)
        .bind(task.retry_of.map(|id| id.to_string()))
        .bind(task.assigned_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.updated_at.to_rfc3339())
        .bind(task.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn task_counts(&self) -> Result<TaskCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = TaskCounts::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => counts.pending = count as u64,
                TaskStatus::Assigned => counts.assigned = count as u64,
                TaskStatus::InProgress => counts.in_progress = count as u64,
                TaskStatus::Completed => counts.completed = count as u64,
                TaskStatus::Failed => counts.failed = count as u64,
                TaskStatus::Cancelled => counts.cancelled = count as u64,
            }
        }
        Ok(counts)
    }

    async fn purge_tasks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < ?1
        "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    include!("sqlite_tests.rs");
}
