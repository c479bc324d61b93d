//! HTTP surface of a worker agent.

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::agent::{WorkerAgent, WorkerHealth};
use super::sensors::SensorReading;
use crate::agents::AgentId;
use crate::comm::{rpc_router, Deduplicated, EnvelopeHandler, RequestWindow};
use crate::errors::ErrorBody;
use crate::tasks::{TaskId, TaskRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub location: String,
    pub output: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SensorQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDataResponse {
    pub location: String,
    pub readings: Vec<SensorReading>,
    pub count: usize,
}

pub async fn health(Extension(agent): Extension<Arc<WorkerAgent>>) -> Json<WorkerHealth> {
    Json(agent.health())
}

pub async fn execute(
    Extension(agent): Extension<Arc<WorkerAgent>>,
    Json(task): Json<TaskRequest>,
) -> Result<Json<ExecuteResponse>, (StatusCode, Json<ErrorBody>)> {
    match agent.execute(&task).await {
        Ok(output) => Ok(Json(ExecuteResponse {
            task_id: task.id,
            agent_id: agent.id().clone(),
            location: agent.registration().location.clone(),
            output,
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                code: "EXECUTION_FAILED".to_string(),
                message: e.to_string(),
            }),
        )),
    }
}

pub async fn sensor_data(
    Extension(agent): Extension<Arc<WorkerAgent>>,
    Query(query): Query<SensorQuery>,
) -> Json<SensorDataResponse> {
    let sensors = agent.sensors();
    Json(SensorDataResponse {
        location: agent.registration().location.clone(),
        readings: sensors.recent(query.limit),
        count: sensors.count(),
    })
}

pub fn router(agent: Arc<WorkerAgent>, window: RequestWindow) -> Router {
    let handler: Arc<dyn EnvelopeHandler> = Arc::new(Deduplicated::new(window, agent.clone()));

    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/sensor_data", get(sensor_data))
        .layer(Extension(agent))
        .merge(rpc_router(handler))
}
