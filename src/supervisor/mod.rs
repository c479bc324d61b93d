// Supervisor Process: the composition root for a supervisor-capable node.

pub mod api;
pub mod dispatch;
pub mod node;

pub use api::router;
pub use dispatch::{DispatchSettings, DispatchStart, TaskDispatcher};
pub use node::{FleetStatus, SupervisorNode, SupervisorSettings, TaskAck, TaskStatus};
