//! Service layer for coordination logic
//!
//! Services sit between the storage trait and callers: the registry tracks
//! agent liveness and capacity, the queue moves messages through their
//! delivery lifecycle, and the coordinator delegates tasks and digests the
//! responses coming back.

pub mod coordinator;
pub mod queue;
pub mod registry;

pub use coordinator::{
    CoordinationStatistics, MaintenanceReport, SupervisorCoordinator, TaskSpec,
};
pub use queue::{AckDisposition, MessageQueue};
pub use registry::{AgentRegistry, RegistryStats};
