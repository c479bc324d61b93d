//! REST surface of a supervisor node.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::node::{FleetStatus, SupervisorNode, TaskAck, TaskStatus};
use crate::agents::{AgentId, AgentRegistration, AgentState, AgentSummary, LoadSnapshot};
use crate::comm::{rpc_router, Deduplicated, EnvelopeHandler, RequestWindow};
use crate::errors::{AllocationError, ErrorBody, RegistryError, SupervisorError};
use crate::tasks::{TaskDescriptor, TaskId};

/// Body of `POST /allocate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPlacementRequest {
    pub task: TaskDescriptor,
    pub agent_id: AgentId,
}

/// Body of `POST /heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    pub load: LoadSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub agent_id: AgentId,
    pub state: AgentState,
}

pub fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SupervisorError::InvalidTask { .. } => StatusCode::BAD_REQUEST,
        SupervisorError::Allocation(e) => match e {
            AllocationError::NoCapableAgent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AllocationError::AllAgentsOverloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AllocationError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            AllocationError::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
            AllocationError::InvalidOverride { .. } => StatusCode::BAD_REQUEST,
        },
    }
}

fn rejected(err: SupervisorError) -> (StatusCode, Json<TaskAck>) {
    (
        status_for(&err),
        Json(TaskAck {
            task_id: None,
            accepted: false,
            placement: None,
            error: Some(ErrorBody::from(&err)),
        }),
    )
}

pub async fn list_agents(Extension(node): Extension<Arc<SupervisorNode>>) -> Json<Vec<AgentSummary>> {
    Json(node.list_agents())
}

pub async fn submit_task(
    Extension(node): Extension<Arc<SupervisorNode>>,
    Json(descriptor): Json<TaskDescriptor>,
) -> (StatusCode, Json<TaskAck>) {
    match node.submit(descriptor).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)),
        Err(e) => rejected(e),
    }
}

pub async fn task_status(
    Extension(node): Extension<Arc<SupervisorNode>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatus>, (StatusCode, Json<ErrorBody>)> {
    let task_id = TaskId::new(task_id);
    node.task_status(&task_id).await.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                code: "UNKNOWN_TASK".to_string(),
                message: format!("no record of task {task_id}"),
            }),
        )
    })
}

pub async fn fleet_status(Extension(node): Extension<Arc<SupervisorNode>>) -> Json<FleetStatus> {
    Json(node.status())
}

pub async fn manual_allocate(
    Extension(node): Extension<Arc<SupervisorNode>>,
    Json(request): Json<ManualPlacementRequest>,
) -> (StatusCode, Json<TaskAck>) {
    info!(agent_id = %request.agent_id, capability = %request.task.capability, "Manual placement requested");
    match node.manual_placement(request.task, &request.agent_id).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)),
        Err(e) => rejected(e),
    }
}

pub async fn register_agent(
    Extension(node): Extension<Arc<SupervisorNode>>,
    Json(registration): Json<AgentRegistration>,
) -> (StatusCode, Json<StateResponse>) {
    let agent = node.register_agent(registration);
    (
        StatusCode::CREATED,
        Json(StateResponse {
            agent_id: agent.id,
            state: agent.state,
        }),
    )
}

pub async fn heartbeat(
    Extension(node): Extension<Arc<SupervisorNode>>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<StateResponse>, (StatusCode, Json<ErrorBody>)> {
    match node.record_heartbeat(&request.agent_id, request.load) {
        Ok(state) => Ok(Json(StateResponse {
            agent_id: request.agent_id,
            state,
        })),
        Err(e) => {
            let status = match e {
                RegistryError::UnknownAgent { .. } => StatusCode::NOT_FOUND,
                RegistryError::Deregistered { .. } => StatusCode::GONE,
            };
            Err((
                status,
                Json(ErrorBody {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
            ))
        }
    }
}

/// Full supervisor router, including the deduplicated `/rpc` endpoint.
pub fn router(node: Arc<SupervisorNode>, window: RequestWindow) -> Router {
    let handler: Arc<dyn EnvelopeHandler> = Arc::new(Deduplicated::new(window, node.clone()));

    Router::new()
        .route("/agents", get(list_agents))
        .route("/task", post(submit_task))
        .route("/task/:id", get(task_status))
        .route("/status", get(fleet_status))
        .route("/allocate", post(manual_allocate))
        .route("/register", post(register_agent))
        .route("/heartbeat", post(heartbeat))
        .layer(Extension(node))
        .merge(rpc_router(handler))
}
