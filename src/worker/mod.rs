// Agent-side process: the counterpart every supervisor dispatches to.

pub mod agent;
pub mod api;
pub mod executor;
pub mod sensors;

pub use agent::{WorkerAgent, WorkerHealth};
pub use api::router;
pub use executor::{SensorContextExecutor, TaskExecutor};
pub use sensors::{RecordedSensorFeed, SensorFeed, SensorReading};
