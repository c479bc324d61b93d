//! Supervisor Process
//!
//! Composes registry, resource monitor, allocator, dispatcher, failover
//! coordinator and communication layer into one control point. Every
//! supervisor-capable node runs all of it; only the current leader accepts
//! tasks, while followers keep their registry warm from agent heartbeats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch::{DispatchSettings, DispatchStart, TaskDispatcher};
use crate::agents::{
    Agent, AgentId, AgentRegistration, AgentRegistry, AgentState, AgentSummary, EscalationPolicy,
    LivenessConfig, LoadScorer, LoadSnapshot, ResourceMonitor, StateCounts,
    SweepReport, TaskAllocator, Zone, ZoneThresholds,
};
use crate::comm::{CommunicationLayer, EnvelopeHandler, Envelope, Payload, Reply, RetryPolicy, Transport};
use crate::errors::{CommunicationError, ErrorBody, RegistryError, SupervisorError};
use crate::failover::{ElectionTimings, FailoverCoordinator, NodeId, Peer, Role, Term};
use crate::tasks::{Placement, TaskDescriptor, TaskId, TaskOutcome, TaskRequest};

/// Everything a supervisor needs that may change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub liveness: LivenessConfig,
    pub sweep_interval: Duration,
    pub thresholds: ZoneThresholds,
    pub escalation: EscalationPolicy,
    pub scorer: LoadScorer,
    pub dispatch: DispatchSettings,
    pub retry: RetryPolicy,
    pub election: ElectionTimings,
    pub peers: Vec<Peer>,
    pub task_history: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            sweep_interval: Duration::from_secs(1),
            thresholds: ZoneThresholds::default(),
            escalation: EscalationPolicy::default(),
            scorer: LoadScorer::default(),
            dispatch: DispatchSettings::default(),
            retry: RetryPolicy::default(),
            election: ElectionTimings::default(),
            peers: Vec::new(),
            task_history: 10_000,
        }
    }
}

/// Lifecycle of a submitted task as seen by its submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Dispatching { placement: Option<Placement> },
    Completed { outcome: TaskOutcome },
    Failed { error: ErrorBody },
}

/// Response to a task submission or manual placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAck {
    pub task_id: Option<TaskId>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub agents: StateCounts,
    pub zones: BTreeMap<Zone, usize>,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

pub struct SupervisorNode {
    id: NodeId,
    registry: Arc<AgentRegistry>,
    monitor: Arc<ResourceMonitor>,
    allocator: Arc<TaskAllocator>,
    dispatcher: Arc<TaskDispatcher>,
    failover: Arc<FailoverCoordinator>,
    comm: Arc<CommunicationLayer>,
    tasks: Cache<TaskId, TaskStatus>,
    sweep_interval: RwLock<Duration>,
    started_at: DateTime<Utc>,
}

impl SupervisorNode {
    pub fn new(id: NodeId, transport: Arc<dyn Transport>, settings: SupervisorSettings) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new(settings.liveness));
        let monitor = Arc::new(ResourceMonitor::new(settings.thresholds));
        let allocator = Arc::new(TaskAllocator::new(
            registry.clone(),
            monitor.clone(),
            settings.escalation.clone(),
            settings.scorer,
        ));
        let comm = Arc::new(CommunicationLayer::new(id.as_str(), transport, settings.retry));
        let dispatcher = Arc::new(TaskDispatcher::new(
            allocator.clone(),
            registry.clone(),
            comm.clone(),
            settings.dispatch,
        ));
        let failover = Arc::new(FailoverCoordinator::new(
            id.clone(),
            settings.peers.clone(),
            comm.clone(),
            settings.election,
        ));

        Arc::new(Self {
            id,
            registry,
            monitor,
            allocator,
            dispatcher,
            failover,
            comm,
            tasks: Cache::builder()
                .max_capacity(settings.task_history as u64)
                .build(),
            sweep_interval: RwLock::new(settings.sweep_interval),
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn allocator(&self) -> &Arc<TaskAllocator> {
        &self.allocator
    }

    pub fn failover(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }

    pub fn is_leader(&self) -> bool {
        self.failover.is_leader()
    }

    pub fn register_agent(&self, registration: AgentRegistration) -> Agent {
        let agent = self.registry.register(registration, Utc::now());
        info!(supervisor = %self.id, agent_id = %agent.id, tier = %agent.tier, state = ?agent.state, "Agent registered");
        agent
    }

    /// Records a heartbeat and feeds its load sample to the resource monitor.
    ///
    /// The monitor is updated under the registry's entry lock and only when
    /// the sample was applied, so a delayed heartbeat cannot change the zone.
    pub fn record_heartbeat(
        &self,
        agent_id: &AgentId,
        load: LoadSnapshot,
    ) -> Result<AgentState, RegistryError> {
        let now = Utc::now();
        self.registry.heartbeat_with(agent_id, load, now, |applied| {
            self.monitor.observe(agent_id, applied, now);
        })
    }

    /// Applies liveness windows and debounce expiry at `now`. Placements on
    /// agents declared DEAD are invalidated so their tasks get re-allocated.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self.registry.sweep(now);
        for agent_id in &report.dead {
            let tasks = self.allocator.invalidate_agent(agent_id);
            if !tasks.is_empty() {
                warn!(agent_id = %agent_id, tasks = tasks.len(), "Re-allocating tasks of dead agent");
            }
        }
        for agent_id in &report.purged {
            self.monitor.forget(agent_id);
        }
        self.monitor.tick(now);
        report
    }

    fn ensure_leader(&self) -> Result<(), SupervisorError> {
        let view = self.failover.view();
        if view.is_leader() {
            Ok(())
        } else {
            Err(SupervisorError::NotLeader {
                leader: view.leader_id().cloned(),
            })
        }
    }

    /// Accepts a task and dispatches it in the background.
    ///
    /// Capability problems are reported immediately. A fully overloaded fleet
    /// still accepts the task; the dispatcher keeps retrying after cooldowns.
    pub async fn submit(self: &Arc<Self>, descriptor: TaskDescriptor) -> Result<TaskAck, SupervisorError> {
        self.ensure_leader()?;
        let now = Utc::now();
        let request = descriptor.into_request(now)?;

        let start = match self.allocator.reserve(&request, &HashSet::new(), now) {
            Ok(ticket) => DispatchStart::Placed(ticket),
            Err(e) if e.is_retryable() => DispatchStart::Overloaded,
            Err(e) => return Err(e.into()),
        };
        Ok(self.track(request, start).await)
    }

    /// Operator override: binds the task to `agent_id` without scoring.
    pub async fn manual_placement(
        self: &Arc<Self>,
        descriptor: TaskDescriptor,
        agent_id: &AgentId,
    ) -> Result<TaskAck, SupervisorError> {
        self.ensure_leader()?;
        let now = Utc::now();
        let request = descriptor.into_request(now)?;
        let ticket = self.allocator.place_manually(&request, agent_id, now)?;
        Ok(self.track(request, DispatchStart::Placed(ticket)).await)
    }

    /// Runs a task to completion on the caller's task.
    pub async fn submit_and_wait(&self, request: TaskRequest) -> Result<TaskOutcome, SupervisorError> {
        self.ensure_leader()?;
        Ok(self.dispatcher.dispatch(request, DispatchStart::Fresh).await?)
    }

    async fn track(self: &Arc<Self>, request: TaskRequest, start: DispatchStart) -> TaskAck {
        let task_id = request.id.clone();
        let placement = match &start {
            DispatchStart::Placed(ticket) => Some(ticket.placement.clone()),
            DispatchStart::Fresh | DispatchStart::Overloaded => None,
        };
        self.tasks
            .insert(
                task_id.clone(),
                TaskStatus::Dispatching {
                    placement: placement.clone(),
                },
            )
            .await;

        let node = self.clone();
        tokio::spawn(async move {
            let task_id = request.id.clone();
            let status = match node.dispatcher.dispatch(request, start).await {
                Ok(outcome) => TaskStatus::Completed { outcome },
                Err(e) => {
                    warn!(task_id = %task_id, code = e.code(), error = %e, "Task failed");
                    TaskStatus::Failed {
                        error: ErrorBody::from(&e),
                    }
                }
            };
            node.tasks.insert(task_id, status).await;
        });

        TaskAck {
            task_id: Some(task_id),
            accepted: true,
            placement,
            error: None,
        }
    }

    pub async fn task_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).await
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry.list().iter().map(Agent::summary).collect()
    }

    pub fn status(&self) -> FleetStatus {
        let view = self.failover.view();
        let mut zones: BTreeMap<Zone, usize> = BTreeMap::new();
        for agent in self.registry.list() {
            if agent.state != AgentState::Dead {
                *zones.entry(self.monitor.zone(&agent.id)).or_default() += 1;
            }
        }

        FleetStatus {
            node_id: self.id.clone(),
            role: view.role,
            term: view.term,
            leader: view.leader_id().cloned(),
            agents: self.registry.state_counts(),
            zones,
            in_flight: self.allocator.in_flight(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Pushes reloaded settings through each component's update operation.
    pub fn apply_settings(&self, settings: &SupervisorSettings) {
        self.registry.set_liveness(settings.liveness);
        self.monitor.update_thresholds(settings.thresholds);
        self.allocator.set_policy(settings.escalation.clone());
        self.allocator.set_scorer(settings.scorer);
        self.dispatcher.set_settings(settings.dispatch);
        self.comm.set_policy(settings.retry);
        self.failover.set_timings(settings.election);
        self.failover.update_membership(settings.peers.clone());
        *self.sweep_interval.write().unwrap_or_else(|e| e.into_inner()) = settings.sweep_interval;
        info!(supervisor = %self.id, "Supervisor settings reloaded");
    }

    fn sweep_interval(&self) -> Duration {
        *self.sweep_interval.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts the liveness sweep, the election driver and the leadership watcher.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let node = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(node.sweep_interval()) => {
                            let report = node.sweep_at(Utc::now());
                            if !report.is_empty() {
                                debug!(supervisor = %node.id, ?report, "Liveness sweep");
                            }
                        }
                    }
                }
            })
        };

        let election = tokio::spawn(self.failover.clone().run(shutdown.clone()));

        let watcher = {
            let node = self.clone();
            let mut views = self.failover.subscribe();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut was_leader = views.borrow().is_leader();
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        changed = views.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let view = views.borrow_and_update().clone();
                            if view.is_leader() && !was_leader {
                                info!(supervisor = %node.id, term = %view.term, agents = node.registry.len(), "Took over supervisor duties");
                            } else if !view.is_leader() && was_leader {
                                warn!(supervisor = %node.id, term = %view.term, leader = ?view.leader_id(), "Handed over supervisor duties");
                            }
                            was_leader = view.is_leader();
                        }
                    }
                }
            })
        };

        vec![sweeper, election, watcher]
    }
}

#[async_trait]
impl EnvelopeHandler for SupervisorNode {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, CommunicationError> {
        match envelope.payload {
            Payload::Register { registration } => {
                let agent = self.register_agent(registration);
                Ok(Reply::Registered { state: agent.state })
            }
            Payload::Heartbeat { agent_id, load } => match self.record_heartbeat(&agent_id, load) {
                Ok(state) => Ok(Reply::HeartbeatAccepted { state }),
                Err(e) => {
                    debug!(agent_id = %agent_id, code = e.code(), "Heartbeat needs re-registration");
                    Ok(Reply::RegistrationRequired { agent_id })
                }
            },
            Payload::RequestVote { claim } => Ok(self.failover.on_vote_request(claim)),
            Payload::LeaderHeartbeat { claim } => Ok(self.failover.on_leader_claim(claim)),
            Payload::Execute { task, .. } => Err(CommunicationError::Rejected {
                peer: self.id.to_string(),
                reason: format!("supervisor does not execute tasks ({})", task.id),
            }),
        }
    }
}
