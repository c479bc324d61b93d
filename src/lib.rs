// Fleet Supervisor Library - supervisory orchestration for edge agent fleets
// This exposes the core components for testing and integration

pub mod agents;
pub mod comm;
pub mod config;
pub mod errors;
pub mod failover;
pub mod shutdown;
pub mod supervisor;
pub mod tasks;
pub mod telemetry;
pub mod worker;

// Re-export key types for easy access
pub use agents::{
    AgentRegistry, AgentState, EscalationPolicy, ResourceMonitor, TaskAllocator, Tier, Zone,
};
pub use comm::{CommunicationLayer, Envelope, Payload, Reply, RetryPolicy};
pub use config::FleetConfig;
pub use errors::{AllocationError, CommunicationError, ElectionError, RegistryError, SupervisorError};
pub use failover::{FailoverCoordinator, LeaderClaim, NodeId, Role, Term};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{SupervisorNode, SupervisorSettings};
pub use tasks::{Placement, TaskDescriptor, TaskId, TaskRequest};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use worker::WorkerAgent;
