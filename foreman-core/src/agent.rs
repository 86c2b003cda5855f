//! Agent domain model and related types
//!
//! This module provides the core agent model for participants in the
//! coordination substrate. Agents are registered under a caller-chosen
//! stable identifier and tracked for capabilities, load, and liveness.
//!
//! # Examples
//!
//! Creating a new agent:
//!
//! ```rust
//! use foreman_core::agent::*;
//!
//! let agent = Agent::builder()
//!     .id("backend-worker-1")
//!     .role(AgentRole::Worker)
//!     .capability("python")
//!     .capability("code_review")
//!     .max_concurrent_tasks(4)
//!     .build()
//!     .unwrap();
//!
//! assert!(agent.has_capability("python"));
//! assert_eq!(agent.status, AgentStatus::Active);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role an agent plays in the coordination topology
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Worker,
    Coordinator,
}

impl AgentRole {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Supervisor => "supervisor",
            AgentRole::Worker => "worker",
            AgentRole::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "supervisor" => Ok(AgentRole::Supervisor),
            "worker" => Ok(AgentRole::Worker),
            "coordinator" => Ok(AgentRole::Coordinator),
            other => Err(Error::decode(format!("unknown agent role: {other}"))),
        }
    }
}

/// Operational status of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Offline,
    Error,
}

impl AgentStatus {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    /// Whether an agent in this status may be offered new work
    pub fn is_assignable(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            "error" => Ok(AgentStatus::Error),
            other => Err(Error::decode(format!("unknown agent status: {other}"))),
        }
    }
}

/// Represents a registered participant in the coordination substrate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub role: AgentRole,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub max_concurrent_tasks: u32,
    pub current_tasks: u32,
    pub load_factor: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Create a new agent with validation
    pub fn new(
        id: String,
        role: AgentRole,
        capabilities: Vec<String>,
        max_concurrent_tasks: u32,
    ) -> Result<Self> {
        Self::validate_id(&id)?;
        Self::validate_capabilities(&capabilities)?;

        let mut deduped: Vec<String> = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            if !deduped.contains(&capability) {
                deduped.push(capability);
            }
        }

        let now = Utc::now();
        Ok(Self {
            id,
            role,
            capabilities: deduped,
            status: AgentStatus::Active,
            max_concurrent_tasks,
            current_tasks: 0,
            load_factor: 0.0,
            last_heartbeat: now,
            registered_at: now,
            updated_at: now,
        })
    }

    /// Create a builder for constructing an Agent
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Validate an agent identifier
    pub fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::validation("Agent id cannot be empty"));
        }
        if id.len() > 100 {
            return Err(Error::validation("Agent id cannot exceed 100 characters"));
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                "Agent id can only contain alphanumeric characters, hyphens, and underscores",
            ));
        }
        Ok(())
    }

    /// Validate a capability list
    fn validate_capabilities(capabilities: &[String]) -> Result<()> {
        for capability in capabilities {
            if capability.trim().is_empty() {
                return Err(Error::validation("Capability cannot be empty"));
            }
            if capability.len() > 100 {
                return Err(Error::validation(
                    "Capability cannot exceed 100 characters",
                ));
            }
        }
        Ok(())
    }

    /// Check if the agent has a specific capability
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Check if the agent has all of the given capabilities
    pub fn has_all_capabilities(&self, capabilities: &[String]) -> bool {
        capabilities.iter().all(|c| self.has_capability(c))
    }

    /// Load factor derived from a task count and concurrency limit.
    ///
    /// A limit of zero means the agent advertises no capacity: any work at
    /// all saturates it.
    pub fn compute_load(current_tasks: u32, max_concurrent_tasks: u32) -> f64 {
        if max_concurrent_tasks == 0 {
            if current_tasks > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            (current_tasks as f64 / max_concurrent_tasks as f64).min(1.0)
        }
    }

    /// Recompute `load_factor` from the current counters
    pub fn recalculate_load(&mut self) {
        self.load_factor = Self::compute_load(self.current_tasks, self.max_concurrent_tasks);
    }

    /// Record a heartbeat, optionally updating status and task count
    pub fn record_heartbeat(&mut self, status: Option<AgentStatus>, current_tasks: Option<u32>) {
        let now = Utc::now();
        self.last_heartbeat = now;
        self.updated_at = now;
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(current_tasks) = current_tasks {
            self.current_tasks = current_tasks;
        }
        self.recalculate_load();
    }

    /// Whether the last heartbeat is older than the given window
    pub fn is_stale(&self, max_age_seconds: u64) -> bool {
        Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .num_seconds()
            > max_age_seconds as i64
    }

    /// Whether the agent can accept another task right now.
    ///
    /// Liveness is checked separately by the registry; this only covers
    /// status and remaining capacity.
    pub fn is_available(&self) -> bool {
        self.status.is_assignable() && self.current_tasks < self.max_concurrent_tasks
    }

    /// Transition the agent to offline
    pub fn mark_offline(&mut self) {
        self.status = AgentStatus::Offline;
        self.updated_at = Utc::now();
    }
}

/// Builder for constructing Agent instances with validation
#[derive(Debug, Clone, Default)]
pub struct AgentBuilder {
    id: Option<String>,
    role: Option<AgentRole>,
    capabilities: Vec<String>,
    max_concurrent_tasks: Option<u32>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent identifier
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the agent role
    pub fn role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Add a capability
    pub fn capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Add multiple capabilities
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(|c| c.into()));
        self
    }

    /// Set the concurrency limit
    pub fn max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    /// Build the Agent instance
    pub fn build(self) -> Result<Agent> {
        let id = self
            .id
            .ok_or_else(|| Error::validation("Agent id is required"))?;
        let role = self
            .role
            .ok_or_else(|| Error::validation("Agent role is required"))?;
        let max = self
            .max_concurrent_tasks
            .ok_or_else(|| Error::validation("Agent max_concurrent_tasks is required"))?;

        Agent::new(id, role, self.capabilities, max)
    }
}
