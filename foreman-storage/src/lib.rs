//! Persistence and coordination services for foreman
//!
//! This crate provides the durable stores behind the coordination
//! substrate together with the services that run on top of them: the
//! agent registry, the message queue, and the supervisor coordinator.
//! Storage is backed by SQLite and degrades to a volatile in-memory
//! store when the database is unreachable.

pub mod error;
pub mod events;
pub mod memory;
pub mod services;
pub mod sqlite;
pub mod store;

pub use error::{Error, Result};
pub use events::{CoordinationEvent, EventBus};
pub use services::{
    AckDisposition, AgentRegistry, CoordinationStatistics, MaintenanceReport, MessageQueue,
    RegistryStats, SupervisorCoordinator, TaskSpec,
};
pub use store::{open_store, CoordinationStore, StoreConfig};

/// Re-export core types for convenience
pub use foreman_core as core;
