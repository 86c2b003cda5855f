//! Core domain models for the Foreman coordination substrate
//!
//! This crate defines the entities shared by every Foreman component:
//! agents, the messages they exchange, the tasks delegated between them,
//! and the configuration that tunes coordination behavior.
//!
//! # Overview
//!
//! - [`agent`] - Agent identity, capabilities, liveness, and load tracking
//! - [`message`] - Typed message envelopes, payloads, and delivery state
//! - [`task`] - Delegated units of work and their lifecycle state machine
//! - [`config`] - Coordination tunables and retry policies
//! - [`error`] - Shared error and result types
//!
//! # Examples
//!
//! ```rust
//! use foreman_core::agent::{Agent, AgentRole, AgentStatus};
//! use foreman_core::message::{Heartbeat, Message, MessagePayload, MessagePriority};
//!
//! let agent = Agent::builder()
//!     .id("review-worker-1")
//!     .role(AgentRole::Worker)
//!     .capability("code_review")
//!     .max_concurrent_tasks(2)
//!     .build()
//!     .unwrap();
//!
//! let message = Message::builder()
//!     .from("supervisor-main")
//!     .to(&agent.id)
//!     .payload(MessagePayload::Heartbeat(Heartbeat {
//!         status: AgentStatus::Idle,
//!         current_tasks: 0,
//!     }))
//!     .priority(MessagePriority::Low)
//!     .build()
//!     .unwrap();
//! assert_eq!(message.to_agent.as_deref(), Some("review-worker-1"));
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod task;

pub use error::{Error, Result};
