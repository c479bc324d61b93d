// Fleet-side state of the supervisor: who the agents are, how loaded they
// are, and where a task should go.

pub mod allocator;
pub mod registry;
pub mod resource_monitor;
pub mod routing;
pub mod sampler;
pub mod types;

pub use allocator::{EscalationPolicy, PlacementDecision, TaskAllocator};
pub use registry::{AgentRegistry, LivenessConfig, StateCounts, SweepReport};
pub use resource_monitor::{ResourceMonitor, Zone, ZoneEvent, ZoneThresholds};
pub use routing::{LoadScorer, PlacementTicket};
pub use sampler::{FixedLoadSampler, LoadSampler, SystemLoadSampler};
pub use types::{
    Agent, AgentId, AgentRegistration, AgentState, AgentSummary, Capability, LoadSnapshot, Tier,
};
