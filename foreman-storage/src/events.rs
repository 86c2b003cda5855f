//! Coordination event notifications
//!
//! Services publish [`CoordinationEvent`]s on a shared [`EventBus`] so
//! observers (the CLI, dashboards, tests) can watch delivery and task
//! activity without polling. Emission is fire-and-forget: with no
//! subscribers the event is dropped and noted at debug level.

use foreman_core::message::{MessageStatus, MessageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Buffered events per subscriber before lagging ones miss messages
pub const DEFAULT_EVENT_CAPACITY: usize = 512;

/// Notification emitted by the coordination services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinationEvent {
    AgentRegistered {
        agent_id: String,
    },
    AgentOffline {
        agent_id: String,
    },
    MessageSent {
        message_id: Uuid,
        message_type: MessageType,
        to_agent: Option<String>,
    },
    MessageRequeued {
        message_id: Uuid,
        retry_count: u32,
    },
    MessageExpired {
        message_id: Uuid,
    },
    MessageResolved {
        message_id: Uuid,
        outcome: MessageStatus,
    },
    TaskAssigned {
        task_id: Uuid,
        agent_id: String,
        attempt: u32,
    },
    TaskCompleted {
        task_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskReassigned {
        task_id: Uuid,
        retry_task_id: Uuid,
        agent_id: String,
        attempt: u32,
    },
}

impl CoordinationEvent {
    /// Stable event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationEvent::AgentRegistered { .. } => "agent_registered",
            CoordinationEvent::AgentOffline { .. } => "agent_offline",
            CoordinationEvent::MessageSent { .. } => "message_sent",
            CoordinationEvent::MessageRequeued { .. } => "message_requeued",
            CoordinationEvent::MessageExpired { .. } => "message_expired",
            CoordinationEvent::MessageResolved { .. } => "message_resolved",
            CoordinationEvent::TaskAssigned { .. } => "task_assigned",
            CoordinationEvent::TaskCompleted { .. } => "task_completed",
            CoordinationEvent::TaskFailed { .. } => "task_failed",
            CoordinationEvent::TaskCancelled { .. } => "task_cancelled",
            CoordinationEvent::TaskReassigned { .. } => "task_reassigned",
        }
    }
}

impl fmt::Display for CoordinationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Broadcast channel fanning coordination events out to subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers
    pub fn emit(&self, event: CoordinationEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("coordination event dropped, no subscribers: {}", e);
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
