//! Coordination configuration types
//!
//! Tunables for liveness, claim visibility, retry budgets, and maintenance
//! sweeps. All durations are plain integers (seconds or milliseconds as
//! named) so the structs deserialize cleanly from files or environment
//! layers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default supervisor identity registered at coordinator startup
pub const DEFAULT_SUPERVISOR_ID: &str = "supervisor-main";

/// Capabilities advertised by the built-in supervisor agent
pub const SUPERVISOR_CAPABILITIES: &[&str] = &[
    "task_coordination",
    "agent_management",
    "progress_tracking",
    "error_handling",
];

/// Settings governing message and task coordination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinationConfig {
    /// Seconds without a heartbeat before an agent stops receiving work
    pub liveness_timeout_seconds: u64,
    /// Seconds without a heartbeat before an agent is marked offline
    pub stale_agent_timeout_seconds: u64,
    /// Seconds a claimed message stays invisible before it is requeued
    pub visibility_timeout_seconds: u64,
    /// Default per-message retry budget when the sender does not set one
    pub default_max_retries: u32,
    /// Maximum assignment attempts per unit of work, original included
    pub max_task_attempts: u32,
    /// Seconds before a live task with no deadline is considered stuck
    pub stuck_task_timeout_seconds: u64,
    /// Seconds terminal records are retained before maintenance purges them
    pub retention_seconds: u64,
    /// Messages drained per supervisor processing pass
    pub drain_batch_size: u32,
    /// Identity the coordinator registers itself under
    pub supervisor_id: String,
    /// Backoff schedule for message delivery attempts
    pub delivery_retry: RetryPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_seconds: 300,
            stale_agent_timeout_seconds: 600,
            visibility_timeout_seconds: 300,
            default_max_retries: 3,
            max_task_attempts: 3,
            stuck_task_timeout_seconds: 7200,
            retention_seconds: 604_800,
            drain_batch_size: 32,
            supervisor_id: DEFAULT_SUPERVISOR_ID.to_string(),
            delivery_retry: RetryPolicy::default(),
        }
    }
}

impl CoordinationConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.liveness_timeout_seconds == 0 {
            return Err(Error::configuration(
                "liveness_timeout_seconds must be greater than zero",
            ));
        }
        if self.stale_agent_timeout_seconds < self.liveness_timeout_seconds {
            return Err(Error::configuration(
                "stale_agent_timeout_seconds must be at least liveness_timeout_seconds",
            ));
        }
        if self.max_task_attempts == 0 {
            return Err(Error::configuration(
                "max_task_attempts must be greater than zero",
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(Error::configuration(
                "drain_batch_size must be greater than zero",
            ));
        }
        crate::agent::Agent::validate_id(&self.supervisor_id)
            .map_err(|e| Error::configuration(format!("supervisor_id is invalid: {e}")))?;
        self.delivery_retry.validate()
    }

    /// Claim visibility window as a chrono duration
    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_seconds as i64)
    }

    /// Liveness window as a chrono duration
    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_seconds as i64)
    }
}

/// Backoff policy for repeated attempts at an operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration("max_attempts must be greater than zero"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::configuration("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::configuration(
                "max_delay_ms must be at least initial_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay to wait before the given attempt, 1-based.
    ///
    /// Attempt 1 runs immediately; attempt 2 waits the initial delay and
    /// each further attempt multiplies it, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(32);
        let factor = self.backoff_multiplier.powi(exponent as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).round() as u64;
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}
