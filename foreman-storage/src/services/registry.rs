//! Agent registry service
//!
//! Tracks which agents exist, whether their heartbeats are fresh, and how
//! much spare capacity each one has. Assignment decisions go through
//! [`AgentRegistry::find_best`], which only considers agents that are live,
//! assignable, and advertise every required capability.

use crate::error::{Error, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::store::CoordinationStore;
use chrono::Utc;
use foreman_core::agent::{Agent, AgentStatus};
use foreman_core::config::CoordinationConfig;
use foreman_core::message::StatusUpdate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry over the durable agent table
pub struct AgentRegistry {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    events: EventBus,
}

/// Aggregate agent counters for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub error: usize,
    /// Agents that could take a task right now
    pub assignable: usize,
}

impl AgentRegistry {
    /// Create a new registry service
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: CoordinationConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Register an agent or refresh an existing registration.
    ///
    /// Re-registering under a known id keeps the original registration
    /// timestamp; everything else is replaced by the new record.
    pub async fn register(&self, agent: Agent) -> Result<Agent> {
        info!("Registering agent {} as {}", agent.id, agent.role);
        self.store.upsert_agent(&agent).await?;
        let stored = self
            .store
            .get_agent(&agent.id)
            .await?
            .ok_or_else(|| Error::not_found("agent", &agent.id))?;
        self.events.emit(CoordinationEvent::AgentRegistered {
            agent_id: stored.id.clone(),
        });
        Ok(stored)
    }

    /// Record a heartbeat, optionally folding in a reported status and task
    /// count, and return the refreshed record
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        current_tasks: Option<u32>,
    ) -> Result<Agent> {
        debug!("Heartbeat from agent {}", agent_id);
        let updated = self
            .store
            .record_heartbeat(agent_id, status, current_tasks, Utc::now())
            .await?;
        if !updated {
            return Err(Error::not_found("agent", agent_id));
        }
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", agent_id))
    }

    /// Fold a worker-sent status update into its registry record.
    ///
    /// The reported load factor is ignored; load is always recomputed from
    /// the task count and configured capacity.
    pub async fn apply_status_update(&self, agent_id: &str, update: &StatusUpdate) -> Result<Agent> {
        debug!("Status update from agent {}: {}", agent_id, update.status);
        let mut agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", agent_id))?;
        agent.record_heartbeat(Some(update.status), update.current_tasks);
        if let Some(capabilities) = &update.capabilities {
            agent.capabilities = capabilities.clone();
        }
        self.store.upsert_agent(&agent).await?;
        Ok(agent)
    }

    /// Fetch a single agent
    pub async fn get(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.store.get_agent(agent_id).await
    }

    /// All registered agents
    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.store.list_agents().await
    }

    /// Registered agents advertising the given capability
    pub async fn list_with_capability(&self, capability: &str) -> Result<Vec<Agent>> {
        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .filter(|agent| agent.has_capability(capability))
            .collect())
    }

    /// Agents able to take on work right now, least loaded first.
    ///
    /// An agent qualifies when its heartbeat is within the liveness window,
    /// its status admits assignment, it has spare capacity, and it advertises
    /// every capability in `required`. Agents named in `exclude` are skipped.
    /// Ties on load go to the agent that has been quiet longest, which
    /// spreads work across an evenly loaded pool.
    pub async fn find_available(
        &self,
        required: &[String],
        exclude: &[String],
        max_results: usize,
    ) -> Result<Vec<Agent>> {
        let liveness = self.config.liveness_timeout_seconds;
        let mut agents: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|agent| {
                agent.is_available()
                    && !agent.is_stale(liveness)
                    && !exclude.contains(&agent.id)
                    && required.iter().all(|cap| agent.has_capability(cap))
            })
            .collect();
        agents.sort_by(|a, b| {
            a.load_factor
                .total_cmp(&b.load_factor)
                .then_with(|| a.last_heartbeat.cmp(&b.last_heartbeat))
                .then_with(|| a.id.cmp(&b.id))
        });
        agents.truncate(max_results);
        Ok(agents)
    }

    /// Pick the least loaded eligible agent, if any
    pub async fn find_best(
        &self,
        required: &[String],
        exclude: &[String],
    ) -> Result<Option<Agent>> {
        let mut best = self.find_available(required, exclude, 1).await?;
        Ok(best.pop())
    }

    /// Mark an agent offline
    pub async fn set_offline(&self, agent_id: &str) -> Result<()> {
        info!("Marking agent {} offline", agent_id);
        let updated = self
            .store
            .set_agent_status(agent_id, AgentStatus::Offline, Utc::now())
            .await?;
        if !updated {
            return Err(Error::not_found("agent", agent_id));
        }
        self.events.emit(CoordinationEvent::AgentOffline {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Move agents whose heartbeats went silent past the stale window to
    /// `Offline`, returning the ids retired by this pass
    pub async fn retire_stale(&self) -> Result<Vec<String>> {
        let stale_after = self.config.stale_agent_timeout_seconds;
        let now = Utc::now();
        let mut retired = Vec::new();
        for agent in self.store.list_agents().await? {
            if agent.status == AgentStatus::Offline || !agent.is_stale(stale_after) {
                continue;
            }
            if self
                .store
                .set_agent_status(&agent.id, AgentStatus::Offline, now)
                .await?
            {
                warn!(
                    "Retiring stale agent {} (last heartbeat {})",
                    agent.id, agent.last_heartbeat
                );
                self.events.emit(CoordinationEvent::AgentOffline {
                    agent_id: agent.id.clone(),
                });
                retired.push(agent.id);
            }
        }
        Ok(retired)
    }

    /// Nudge an agent's tracked task count after an assignment or completion
    pub async fn adjust_load(&self, agent_id: &str, delta: i32) -> Result<()> {
        let updated = self
            .store
            .adjust_agent_load(agent_id, delta, Utc::now())
            .await?;
        if !updated {
            warn!("Load adjustment for unknown agent {}", agent_id);
        }
        Ok(())
    }

    /// Aggregate counters across all registered agents
    pub async fn statistics(&self) -> Result<RegistryStats> {
        let liveness = self.config.liveness_timeout_seconds;
        let agents = self.store.list_agents().await?;
        let mut stats = RegistryStats {
            total: agents.len(),
            ..Default::default()
        };
        for agent in &agents {
            match agent.status {
                AgentStatus::Active => stats.active += 1,
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Offline => stats.offline += 1,
                AgentStatus::Error => stats.error += 1,
            }
            if agent.is_available() && !agent.is_stale(liveness) {
                stats.assignable += 1;
            }
        }
        Ok(stats)
    }
}
