// Failover Coordinator: leader election among supervisor-capable nodes.

pub mod claim;
pub mod coordinator;
pub mod state_machine;

pub use claim::{majority, ElectionView, LeaderClaim, NodeId, Peer, Role, Term};
pub use coordinator::{ElectionTimings, FailoverCoordinator};
pub use state_machine::{ElectionEvent, ElectionNode, VoteDecision};
