//! Worker agent: registers with every known supervisor, reports load on a
//! fixed interval and executes the tasks dispatched to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::executor::TaskExecutor;
use super::sensors::SensorFeed;
use crate::agents::{AgentId, AgentRegistration, AgentState, LoadSampler, LoadSnapshot, Tier};
use crate::comm::{CommunicationLayer, EnvelopeHandler, Envelope, Payload, Reply};
use crate::errors::CommunicationError;
use crate::tasks::TaskRequest;

/// Body of the worker's `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub agent_id: AgentId,
    pub location: String,
    pub tier: Tier,
    /// Most recent state reported back by a supervisor.
    pub state: Option<AgentState>,
    pub load: LoadSnapshot,
    pub readings: usize,
    pub executed: u64,
    pub uptime_secs: u64,
}

pub struct WorkerAgent {
    registration: AgentRegistration,
    supervisors: RwLock<Vec<String>>,
    comm: Arc<CommunicationLayer>,
    sampler: Arc<dyn LoadSampler>,
    executor: Arc<dyn TaskExecutor>,
    sensors: Arc<dyn SensorFeed>,
    queue_depth: Arc<AtomicU32>,
    executed: AtomicU64,
    state: RwLock<Option<AgentState>>,
    heartbeat_interval: Duration,
    started_at: DateTime<Utc>,
}

impl WorkerAgent {
    /// `queue_depth` is the gauge the sampler reads; the agent keeps it equal
    /// to the number of tasks currently executing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration: AgentRegistration,
        supervisors: Vec<String>,
        comm: Arc<CommunicationLayer>,
        sampler: Arc<dyn LoadSampler>,
        executor: Arc<dyn TaskExecutor>,
        sensors: Arc<dyn SensorFeed>,
        queue_depth: Arc<AtomicU32>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registration,
            supervisors: RwLock::new(supervisors),
            comm,
            sampler,
            executor,
            sensors,
            queue_depth,
            executed: AtomicU64::new(0),
            state: RwLock::new(None),
            heartbeat_interval,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.registration.id
    }

    pub fn registration(&self) -> &AgentRegistration {
        &self.registration
    }

    pub fn sensors(&self) -> &Arc<dyn SensorFeed> {
        &self.sensors
    }

    pub fn supervisors(&self) -> Vec<String> {
        self.supervisors.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_supervisors(&self, supervisors: Vec<String>) {
        *self.supervisors.write().unwrap_or_else(|e| e.into_inner()) = supervisors;
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    fn note_state(&self, state: AgentState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    pub async fn register_with(&self, supervisor: &str) -> Result<AgentState, CommunicationError> {
        let reply = self
            .comm
            .call(
                supervisor,
                Payload::Register {
                    registration: self.registration.clone(),
                },
            )
            .await?;

        match reply {
            Reply::Registered { state } => {
                info!(agent_id = %self.id(), supervisor, state = ?state, "Registered with supervisor");
                self.note_state(state);
                Ok(state)
            }
            other => Err(CommunicationError::Rejected {
                peer: supervisor.to_string(),
                reason: format!("unexpected registration reply {other:?}"),
            }),
        }
    }

    /// Registers with every supervisor. Returns how many accepted.
    pub async fn register_all(&self) -> usize {
        let mut accepted = 0;
        for supervisor in self.supervisors() {
            match self.register_with(&supervisor).await {
                Ok(_) => accepted += 1,
                Err(e) => warn!(agent_id = %self.id(), supervisor = %supervisor, error = %e, "Registration failed"),
            }
        }
        accepted
    }

    /// Sends one heartbeat to `supervisor`, re-registering once if it no
    /// longer knows this agent.
    pub async fn heartbeat(&self, supervisor: &str, load: LoadSnapshot) -> Result<(), CommunicationError> {
        let payload = Payload::Heartbeat {
            agent_id: self.id().clone(),
            load,
        };

        match self.comm.call(supervisor, payload.clone()).await? {
            Reply::HeartbeatAccepted { state } => {
                self.note_state(state);
                Ok(())
            }
            Reply::Ack => Ok(()),
            Reply::RegistrationRequired { .. } => {
                info!(agent_id = %self.id(), supervisor, "Supervisor asked for re-registration");
                self.register_with(supervisor).await?;
                if let Reply::HeartbeatAccepted { state } = self.comm.call(supervisor, payload).await? {
                    self.note_state(state);
                }
                Ok(())
            }
            other => Err(CommunicationError::Rejected {
                peer: supervisor.to_string(),
                reason: format!("unexpected heartbeat reply {other:?}"),
            }),
        }
    }

    /// Samples load once and reports it to every supervisor.
    pub async fn send_heartbeats(&self) {
        let load = self.sampler.sample();
        for supervisor in self.supervisors() {
            if let Err(e) = self.heartbeat(&supervisor, load).await {
                warn!(agent_id = %self.id(), supervisor = %supervisor, error = %e, "Heartbeat failed");
            }
        }
    }

    /// Registers, then heartbeats until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.register_all().await;
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.send_heartbeats().await,
            }
        }
        info!(agent_id = %self.id(), "Worker agent stopped");
    }

    /// Executes `task`, counting it in the queue depth while it runs.
    pub async fn execute(&self, task: &TaskRequest) -> anyhow::Result<serde_json::Value> {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        let result = self.executor.execute(task).await;
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);

        match &result {
            Ok(_) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                debug!(agent_id = %self.id(), task_id = %task.id, "Task executed");
            }
            Err(e) => warn!(agent_id = %self.id(), task_id = %task.id, error = %e, "Task execution failed"),
        }
        result
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> WorkerHealth {
        WorkerHealth {
            agent_id: self.registration.id.clone(),
            location: self.registration.location.clone(),
            tier: self.registration.tier,
            state: *self.state.read().unwrap_or_else(|e| e.into_inner()),
            load: self.sampler.sample(),
            readings: self.sensors.count(),
            executed: self.executed(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

#[async_trait]
impl EnvelopeHandler for WorkerAgent {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, CommunicationError> {
        match envelope.payload {
            Payload::Execute {
                task,
                placement_version,
            } => {
                debug!(agent_id = %self.id(), task_id = %task.id, placement_version, "Execute received");
                let output = self
                    .execute(&task)
                    .await
                    .map_err(|e| CommunicationError::Rejected {
                        peer: self.id().to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Reply::Executed {
                    task_id: task.id,
                    agent_id: self.id().clone(),
                    output,
                })
            }
            other => Err(CommunicationError::Rejected {
                peer: self.id().to_string(),
                reason: format!("worker agents do not handle {}", other.kind()),
            }),
        }
    }
}
