//! Message protocol: envelope, typed payloads, and the wire codec
//!
//! Messages are immutable envelopes constructed through a validating
//! builder. The payload is a closed tagged union keyed by the message
//! type, so an envelope whose content does not match its declared type is
//! unrepresentable. Delivery-state fields (`status`, `retry_count`, claim
//! bookkeeping) are mutated only by the queue manager after a message has
//! been handed over for delivery.
//!
//! # Examples
//!
//! Building and encoding a task request:
//!
//! ```rust
//! use foreman_core::message::*;
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! let message = Message::builder()
//!     .from("supervisor-main")
//!     .to("backend-worker-1")
//!     .payload(MessagePayload::TaskRequest(TaskRequest {
//!         task_id: Uuid::new_v4(),
//!         task_type: "code_review".into(),
//!         description: "Review the storage layer".into(),
//!         parameters: json!({"pull_request": 42}),
//!         required_capabilities: vec!["code_review".into()],
//!         deadline: None,
//!     }))
//!     .priority(MessagePriority::High)
//!     .build()
//!     .unwrap();
//!
//! let encoded = message.encode().unwrap();
//! assert_eq!(Message::decode(&encoded).unwrap(), message);
//! ```

use crate::agent::{Agent, AgentStatus};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default retry budget for newly built messages
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Discriminant of a message payload, used for filtering and storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    Heartbeat,
    ErrorReport,
    Coordination,
}

impl MessageType {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::Heartbeat => "heartbeat",
            MessageType::ErrorReport => "error_report",
            MessageType::Coordination => "coordination",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task_request" => Ok(MessageType::TaskRequest),
            "task_response" => Ok(MessageType::TaskResponse),
            "status_update" => Ok(MessageType::StatusUpdate),
            "heartbeat" => Ok(MessageType::Heartbeat),
            "error_report" => Ok(MessageType::ErrorReport),
            "coordination" => Ok(MessageType::Coordination),
            other => Err(Error::decode(format!("unknown message type: {other}"))),
        }
    }
}

/// Message urgency, encoded on the wire as an integer where lower means
/// more urgent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessagePriority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Background = 5,
}

impl MessagePriority {
    /// Numeric wire value (1 = critical .. 5 = background)
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Medium
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessagePriority::Critical),
            2 => Ok(MessagePriority::High),
            3 => Ok(MessagePriority::Medium),
            4 => Ok(MessagePriority::Low),
            5 => Ok(MessagePriority::Background),
            other => Err(Error::decode(format!(
                "priority {other} outside the 1-5 range"
            ))),
        }
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> u8 {
        priority.value()
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Delivery state of a message, owned by the queue manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Expired,
}

impl MessageStatus {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    /// Whether this state accepts no further delivery attempts
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Processed | MessageStatus::Failed | MessageStatus::Expired
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "processed" => Ok(MessageStatus::Processed),
            "failed" => Ok(MessageStatus::Failed),
            "expired" => Ok(MessageStatus::Expired),
            other => Err(Error::decode(format!("unknown message status: {other}"))),
        }
    }
}

/// Task state a worker reports back in a `task_response`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    InProgress,
    Completed,
    Failed,
}

/// Request to execute a unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_id: Uuid,
    pub task_type: String,
    pub description: String,
    pub parameters: Value,
    pub required_capabilities: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Progress or completion report for a delegated task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub status: ReportedStatus,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub next_steps: Option<Vec<String>>,
}

/// Unsolicited agent state refresh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub status: AgentStatus,
    pub current_tasks: Option<u32>,
    pub load_factor: Option<f64>,
    pub capabilities: Option<Vec<String>>,
}

/// Periodic liveness signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub status: AgentStatus,
    pub current_tasks: u32,
}

/// Out-of-band error notification, optionally tied to a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub task_id: Option<Uuid>,
    pub error_type: String,
    pub message: String,
    /// When set, the referenced task is failed rather than annotated
    pub terminal: bool,
}

/// Control-plane signals exchanged between agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Coordination {
    CancelTask {
        task_id: Uuid,
    },
    SupervisorShutdown {
        supervisor_id: String,
        active_tasks: u32,
    },
    Announcement {
        topic: String,
        detail: Value,
    },
}

/// Closed union of message contents, one variant per message type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessagePayload {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    StatusUpdate(StatusUpdate),
    Heartbeat(Heartbeat),
    ErrorReport(ErrorReport),
    Coordination(Coordination),
}

impl MessagePayload {
    /// Type discriminant of this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::TaskRequest(_) => MessageType::TaskRequest,
            MessagePayload::TaskResponse(_) => MessageType::TaskResponse,
            MessagePayload::StatusUpdate(_) => MessageType::StatusUpdate,
            MessagePayload::Heartbeat(_) => MessageType::Heartbeat,
            MessagePayload::ErrorReport(_) => MessageType::ErrorReport,
            MessagePayload::Coordination(_) => MessageType::Coordination,
        }
    }

    /// Validate the schema rules the type system cannot express
    pub fn validate(&self) -> Result<()> {
        match self {
            MessagePayload::TaskRequest(request) => {
                if request.task_type.trim().is_empty() {
                    return Err(Error::validation("Task request requires a task_type"));
                }
                if request.description.trim().is_empty() {
                    return Err(Error::validation("Task request requires a description"));
                }
                if !request.parameters.is_object() {
                    return Err(Error::validation(
                        "Task request parameters must be a JSON object",
                    ));
                }
                if request.required_capabilities.iter().any(|c| c.trim().is_empty()) {
                    return Err(Error::validation("Required capabilities cannot be empty"));
                }
            }
            MessagePayload::TaskResponse(response) => {
                if let Some(progress) = response.progress {
                    if !(0.0..=1.0).contains(&progress) {
                        return Err(Error::validation("Progress must be within [0, 1]"));
                    }
                }
            }
            MessagePayload::StatusUpdate(update) => {
                if let Some(load_factor) = update.load_factor {
                    if !(0.0..=1.0).contains(&load_factor) {
                        return Err(Error::validation("Load factor must be within [0, 1]"));
                    }
                }
                if let Some(capabilities) = &update.capabilities {
                    if capabilities.iter().any(|c| c.trim().is_empty()) {
                        return Err(Error::validation("Capabilities cannot be empty"));
                    }
                }
            }
            MessagePayload::Heartbeat(_) => {}
            MessagePayload::ErrorReport(report) => {
                if report.error_type.trim().is_empty() {
                    return Err(Error::validation("Error report requires an error_type"));
                }
                if report.message.trim().is_empty() {
                    return Err(Error::validation("Error report requires a message"));
                }
            }
            MessagePayload::Coordination(Coordination::Announcement { topic, .. }) => {
                if topic.trim().is_empty() {
                    return Err(Error::validation("Announcement requires a topic"));
                }
            }
            MessagePayload::Coordination(_) => {}
        }
        Ok(())
    }
}

/// An immutable envelope exchanged between agents via the store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub from_agent: String,
    /// `None` addresses every active agent (broadcast)
    pub to_agent: Option<String>,
    pub payload: MessagePayload,
    pub priority: MessagePriority,
    pub parent_id: Option<Uuid>,
    /// Set on fan-out copies derived from one broadcast send
    pub broadcast_id: Option<Uuid>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Message {
    /// Create a builder for constructing a Message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Type discriminant of the payload
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Whether this message addresses every active agent
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }

    /// Whether the message has outlived its `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether another delivery attempt is still within the retry budget
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Serialize to the wire form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the wire form, rejecting malformed input with a decode error
    pub fn decode(input: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(input)
            .map_err(|e| Error::decode(format!("malformed message: {e}")))?;
        message
            .validate()
            .map_err(|e| Error::decode(format!("invalid message: {e}")))?;
        Ok(message)
    }

    /// Validate envelope addressing and payload schema
    pub fn validate(&self) -> Result<()> {
        Agent::validate_id(&self.from_agent)?;
        if let Some(to_agent) = &self.to_agent {
            Agent::validate_id(to_agent)?;
        }
        self.payload.validate()
    }

    /// Build a reply envelope linked to this message.
    ///
    /// The reply is addressed to the original sender, inherits the
    /// priority, and records this message as its parent.
    pub fn response_to(&self, from: &str, payload: MessagePayload) -> Result<Message> {
        Message::builder()
            .from(from)
            .to(&self.from_agent)
            .payload(payload)
            .priority(self.priority)
            .parent(self.id)
            .max_retries(self.max_retries)
            .build()
    }

    /// Derive a fan-out copy of a broadcast for one concrete recipient.
    ///
    /// The copy gets a fresh id and records this message's id as its
    /// `broadcast_id`; `created_at` is preserved so all copies sort into
    /// the same FIFO position.
    pub fn broadcast_copy(&self, recipient: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            to_agent: Some(recipient.to_string()),
            broadcast_id: Some(self.broadcast_id.unwrap_or(self.id)),
            ..self.clone()
        }
    }
}

/// Builder for constructing Message instances with validation
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    recipient: Option<Option<String>>,
    payload: Option<MessagePayload>,
    priority: MessagePriority,
    parent_id: Option<Uuid>,
    max_retries: u32,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            ..Self::default()
        }
    }

    /// Set the sending agent
    pub fn from<S: Into<String>>(mut self, from: S) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Address the message to a single agent
    pub fn to<S: Into<String>>(mut self, to: S) -> Self {
        self.recipient = Some(Some(to.into()));
        self
    }

    /// Address the message to every active agent
    pub fn broadcast(mut self) -> Self {
        self.recipient = Some(None);
        self
    }

    /// Set the typed payload
    pub fn payload(mut self, payload: MessagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the priority (defaults to `Medium`)
    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Link this message to the request it answers
    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set the retry budget (defaults to [`DEFAULT_MAX_RETRIES`])
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Expire the message a relative duration after construction
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Expire the message at an absolute instant (takes precedence over
    /// [`ttl`](Self::ttl))
    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Build the Message instance
    pub fn build(self) -> Result<Message> {
        let from = self
            .from
            .ok_or_else(|| Error::validation("Message sender is required"))?;
        let to_agent = self.recipient.ok_or_else(|| {
            Error::validation("Message recipient is required (use to() or broadcast())")
        })?;
        let payload = self
            .payload
            .ok_or_else(|| Error::validation("Message payload is required"))?;

        if let Some(ttl) = self.ttl {
            if ttl <= Duration::zero() {
                return Err(Error::validation("Message ttl must be positive"));
            }
        }

        let created_at = Utc::now();
        let expires_at = self.expires_at.or(self.ttl.map(|ttl| created_at + ttl));

        let message = Message {
            id: Uuid::new_v4(),
            from_agent: from,
            to_agent,
            payload,
            priority: self.priority,
            parent_id: self.parent_id,
            broadcast_id: None,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at,
            expires_at,
            claimed_by: None,
            claimed_at: None,
            processed_at: None,
            error_message: None,
        };
        message.validate()?;
        Ok(message)
    }
}
