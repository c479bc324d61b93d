// Leader failover across three supervisor-capable nodes.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use common::{peers, supervisor, worker, CountingExecutor, WorkerSpec};
use fleet_supervisor::agents::Capability;
use fleet_supervisor::comm::LocalNetwork;
use fleet_supervisor::failover::{Role, Term};
use fleet_supervisor::supervisor::{SupervisorNode, SupervisorSettings};
use fleet_supervisor::tasks::TaskDescriptor;

const NODES: [&str; 3] = ["sup-a", "sup-b", "sup-c"];

fn cluster(network: &Arc<LocalNetwork>) -> Vec<Arc<SupervisorNode>> {
    NODES
        .iter()
        .map(|id| {
            supervisor(
                network,
                id,
                SupervisorSettings {
                    peers: peers(&NODES),
                    ..SupervisorSettings::default()
                },
            )
        })
        .collect()
}

fn leaders(nodes: &[Arc<SupervisorNode>]) -> Vec<Arc<SupervisorNode>> {
    nodes.iter().filter(|n| n.is_leader()).cloned().collect()
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_and_old_leader_steps_down() {
    let network = LocalNetwork::new();
    let nodes = cluster(&network);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for node in &nodes {
        node.spawn_background(shutdown_rx.clone());
    }

    let executor = Arc::new(CountingExecutor::default());
    let office = worker(&network, WorkerSpec::edge("office", "air_quality"), executor.clone(), &NODES).await;

    sleep(Duration::from_secs(10)).await;
    let current = leaders(&nodes);
    assert_eq!(current.len(), 1);
    let old = current[0].clone();
    let old_term = old.failover().view().term;

    // The leader drops off the network and stops heartbeating.
    network.set_down(old.id().as_str(), true);
    sleep(Duration::from_secs(8)).await;

    let survivors: Vec<_> = nodes.iter().filter(|n| n.id() != old.id()).cloned().collect();
    let new_leaders = leaders(&survivors);
    assert_eq!(new_leaders.len(), 1);
    let new = new_leaders[0].clone();
    let new_term = new.failover().view().term;
    assert!(new_term > old_term, "{new_term} should exceed {old_term}");
    for node in &survivors {
        assert_eq!(node.failover().view().leader_id(), Some(new.id()));
    }

    // The new leader allocates from its own registry view.
    office.agent.send_heartbeats().await;
    let ack = new
        .submit(TaskDescriptor {
            capability: Capability::new("air_quality"),
            query: String::new(),
            location: None,
            context: serde_json::Value::Null,
            deadline_ms: None,
            resubmission_of: None,
        })
        .await
        .unwrap();
    assert_eq!(ack.placement.unwrap().agent_id, office.id());

    // The old leader reconnects and yields to the higher term.
    network.set_down(old.id().as_str(), false);
    sleep(Duration::from_secs(2)).await;

    let view = old.failover().view();
    assert_eq!(view.role, Role::Follower);
    assert!(view.term >= new_term);
    assert_eq!(leaders(&nodes).len(), 1);

    // No term was ever claimed by two nodes.
    let mut claimed: HashMap<Term, String> = HashMap::new();
    for node in &nodes {
        for claim in node.failover().promotions() {
            if let Some(other) = claimed.insert(claim.term, claim.candidate.to_string()) {
                panic!("term {} claimed by {} and {}", claim.term, other, claim.candidate);
            }
        }
    }

    shutdown_tx.send_replace(true);
}

#[tokio::test(start_paused = true)]
async fn status_reports_leader_and_agent_counts() {
    let network = LocalNetwork::new();
    let nodes = cluster(&network);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    for node in &nodes {
        node.spawn_background(shutdown_rx.clone());
    }
    let executor = Arc::new(CountingExecutor::default());
    worker(&network, WorkerSpec::edge("office", "air_quality"), executor.clone(), &NODES).await;
    worker(&network, WorkerSpec::edge("kitchen", "air_quality"), executor, &NODES).await;

    sleep(Duration::from_secs(10)).await;
    let leader = leaders(&nodes)[0].clone();

    for node in &nodes {
        let status = node.status();
        assert_eq!(status.leader.as_ref(), Some(leader.id()));
        assert_eq!(status.agents.active, 2);
        assert_eq!(status.term, leader.failover().view().term);
    }
    assert_eq!(leader.status().role, Role::Leader);
}
