use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use super::sensors::SensorFeed;
use crate::tasks::TaskRequest;

/// Runs a dispatched task on the agent and produces its output.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskRequest) -> Result<serde_json::Value>;
}

/// Answers with the query and a summary of the agent's recent sensor readings.
///
/// Stands in for a local inference backend, which is plugged in through
/// [`TaskExecutor`].
pub struct SensorContextExecutor {
    location: String,
    sensors: Arc<dyn SensorFeed>,
    window: Duration,
}

impl SensorContextExecutor {
    pub fn new(location: impl Into<String>, sensors: Arc<dyn SensorFeed>) -> Self {
        Self {
            location: location.into(),
            sensors,
            window: Duration::minutes(10),
        }
    }
}

#[async_trait]
impl TaskExecutor for SensorContextExecutor {
    async fn execute(&self, task: &TaskRequest) -> Result<serde_json::Value> {
        let now = Utc::now();
        let sensor_context = match self.sensors.summary(self.window, now) {
            Some(summary) => serde_json::to_value(summary)?,
            None => json!({ "status": "no_recent_data" }),
        };

        Ok(json!({
            "response": task.payload.query,
            "context": task.payload.context,
            "sensor_context": sensor_context,
            "location": self.location,
            "timestamp": now,
        }))
    }
}
