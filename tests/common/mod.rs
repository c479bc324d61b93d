// Shared fleet fixtures: supervisors and worker agents wired over an
// in-process network.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_supervisor::agents::{AgentId, AgentRegistration, Capability, FixedLoadSampler, Tier};
use fleet_supervisor::comm::{CommunicationLayer, Deduplicated, LocalNetwork, RequestWindow, RetryPolicy};
use fleet_supervisor::failover::{NodeId, Peer};
use fleet_supervisor::supervisor::{SupervisorNode, SupervisorSettings, TaskStatus};
use fleet_supervisor::tasks::{TaskId, TaskRequest};
use fleet_supervisor::worker::{RecordedSensorFeed, TaskExecutor, WorkerAgent};

/// Completes immediately and counts executions.
#[derive(Default)]
pub struct CountingExecutor {
    pub runs: AtomicU32,
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn execute(&self, task: &TaskRequest) -> Result<serde_json::Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "query": task.payload.query }))
    }
}

impl CountingExecutor {
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Never finishes.
pub struct StallingExecutor;

#[async_trait]
impl TaskExecutor for StallingExecutor {
    async fn execute(&self, _task: &TaskRequest) -> Result<serde_json::Value> {
        std::future::pending::<()>().await;
        Ok(serde_json::Value::Null)
    }
}

/// Always fails.
pub struct FailingExecutor;

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _task: &TaskRequest) -> Result<serde_json::Value> {
        Err(anyhow!("sensor offline"))
    }
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(10),
        jitter: false,
        ..RetryPolicy::default()
    }
}

pub fn peers(ids: &[&str]) -> Vec<Peer> {
    ids.iter()
        .map(|id| Peer {
            id: NodeId::from(*id),
            address: id.to_string(),
        })
        .collect()
}

/// A supervisor reachable at `id` on `network`.
pub fn supervisor(network: &Arc<LocalNetwork>, id: &str, settings: SupervisorSettings) -> Arc<SupervisorNode> {
    let node = SupervisorNode::new(NodeId::from(id), Arc::new(network.transport_for(id)), settings);
    network.attach(id, Arc::new(Deduplicated::new(RequestWindow::default(), node.clone())));
    node
}

/// Drives a lone supervisor through its first election.
pub async fn elect(node: &Arc<SupervisorNode>) {
    for _ in 0..20 {
        if node.is_leader() {
            return;
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        node.failover().tick().await;
    }
    assert!(node.is_leader(), "{} never became leader", node.id());
}

pub struct WorkerSpec<'a> {
    pub id: &'a str,
    pub tier: Tier,
    pub capability: &'a str,
    pub cpu: f64,
    pub memory: f64,
}

impl<'a> WorkerSpec<'a> {
    pub fn edge(id: &'a str, capability: &'a str) -> Self {
        Self {
            id,
            tier: Tier::Edge,
            capability,
            cpu: 0.2,
            memory: 0.2,
        }
    }

    pub fn load(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu = cpu;
        self.memory = memory;
        self
    }
}

pub struct TestWorker {
    pub agent: Arc<WorkerAgent>,
    pub sampler: Arc<FixedLoadSampler>,
}

impl TestWorker {
    pub fn id(&self) -> AgentId {
        self.agent.id().clone()
    }
}

/// A worker agent reachable at `spec.id`, registered with `supervisors`
/// and with one heartbeat already delivered.
pub async fn worker(
    network: &Arc<LocalNetwork>,
    spec: WorkerSpec<'_>,
    executor: Arc<dyn TaskExecutor>,
    supervisors: &[&str],
) -> TestWorker {
    let registration = AgentRegistration {
        id: AgentId::from(spec.id),
        location: spec.id.to_string(),
        tier: spec.tier,
        capabilities: BTreeSet::from([Capability::new(spec.capability)]),
        address: spec.id.to_string(),
    };
    let comm = Arc::new(CommunicationLayer::new(
        spec.id,
        Arc::new(network.transport_for(spec.id)),
        quick_retry(),
    ));
    let sampler = Arc::new(FixedLoadSampler::new(spec.cpu, spec.memory, 0));
    let agent = Arc::new(WorkerAgent::new(
        registration,
        supervisors.iter().map(|s| s.to_string()).collect(),
        comm,
        sampler.clone(),
        executor,
        Arc::new(RecordedSensorFeed::default()),
        Arc::new(AtomicU32::new(0)),
        Duration::from_secs(5),
    ));
    network.attach(spec.id, Arc::new(Deduplicated::new(RequestWindow::default(), agent.clone())));

    agent.register_all().await;
    agent.send_heartbeats().await;
    TestWorker { agent, sampler }
}

/// Waits until a submitted task leaves the dispatching state.
pub async fn settled(node: &SupervisorNode, task_id: &TaskId) -> TaskStatus {
    for _ in 0..2_000 {
        match node.task_status(task_id).await {
            Some(TaskStatus::Dispatching { .. }) | None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Some(status) => return status,
        }
    }
    panic!("task {task_id} never settled");
}
