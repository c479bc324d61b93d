//! Failover Coordinator
//!
//! Drives an [`ElectionNode`] from timers and messages. All election traffic
//! travels as envelopes through the [`CommunicationLayer`], so peers in the
//! same process behave exactly like peers on the network.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use statig::prelude::*;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::claim::{ElectionView, LeaderClaim, NodeId, Peer, Role, Term};
use super::state_machine::{ElectionEvent, ElectionNode, VoteDecision};
use crate::comm::{CommunicationLayer, Payload, Reply, RetryPolicy};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimings {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// How long a candidate waits for a majority.
    pub candidacy_timeout: Duration,
    /// Upper bound of the random pause after a failed candidacy.
    pub retry_backoff_max: Duration,
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(500),
            candidacy_timeout: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(1000),
        }
    }
}

impl ElectionTimings {
    fn random_election_timeout(&self) -> Duration {
        random_between(self.election_timeout_min, self.election_timeout_max)
    }

    fn random_backoff(&self) -> Duration {
        random_between(Duration::ZERO, self.retry_backoff_max)
    }
}

fn random_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let millis = rand::rng().random_range(low.as_millis() as u64..=high.as_millis() as u64);
    Duration::from_millis(millis)
}

pub struct FailoverCoordinator {
    id: NodeId,
    machine: Mutex<StateMachine<ElectionNode>>,
    peers: RwLock<Vec<Peer>>,
    comm: Arc<CommunicationLayer>,
    timings: RwLock<ElectionTimings>,
    /// Election deadline while following, next heartbeat while leading.
    deadline: Mutex<Instant>,
    view: watch::Sender<ElectionView>,
    promotions: Mutex<Vec<LeaderClaim>>,
}

impl FailoverCoordinator {
    pub fn new(
        id: NodeId,
        peers: Vec<Peer>,
        comm: Arc<CommunicationLayer>,
        timings: ElectionTimings,
    ) -> Self {
        let machine = ElectionNode::new(id.clone()).state_machine();
        let (view, _) = watch::channel(ElectionView {
            node_id: id.clone(),
            role: Role::Follower,
            term: Term::default(),
            leader: None,
        });
        let peers = peers.into_iter().filter(|peer| peer.id != id).collect();

        Self {
            id,
            machine: Mutex::new(machine),
            peers: RwLock::new(peers),
            comm,
            timings: RwLock::new(timings),
            deadline: Mutex::new(Instant::now() + timings.random_election_timeout()),
            view,
            promotions: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn view(&self) -> ElectionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionView> {
        self.view.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.view.borrow().is_leader()
    }

    /// Every claim this node committed as leader, oldest first.
    pub fn promotions(&self) -> Vec<LeaderClaim> {
        self.promotions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn timings(&self) -> ElectionTimings {
        *self.timings.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_timings(&self, timings: ElectionTimings) {
        *self.timings.write().unwrap_or_else(|e| e.into_inner()) = timings;
        info!(
            election_timeout_min_ms = timings.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms = timings.election_timeout_max.as_millis() as u64,
            "Election timings updated"
        );
    }

    /// Replaces the peer set. Takes effect from the next candidacy.
    pub fn update_membership(&self, peers: Vec<Peer>) {
        let peers: Vec<Peer> = peers.into_iter().filter(|peer| peer.id != self.id).collect();
        info!(node_id = %self.id, peers = peers.len(), "Election membership updated");
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = peers;
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Answers a peer's vote request.
    pub fn on_vote_request(&self, claim: LeaderClaim) -> Reply {
        let (snapshot, _) = self.handle(ElectionEvent::VoteRequested { claim });
        let decision = snapshot.last_vote.unwrap_or(VoteDecision {
            term: snapshot.term,
            granted: false,
        });
        if decision.granted {
            self.reset_election_deadline();
        }
        Reply::Vote {
            voter: self.id.clone(),
            term: decision.term,
            granted: decision.granted,
        }
    }

    /// Answers a leader heartbeat.
    pub fn on_leader_claim(&self, claim: LeaderClaim) -> Reply {
        let (snapshot, _) = self.handle(ElectionEvent::ClaimObserved { claim });
        if snapshot.last_claim_accepted {
            self.reset_election_deadline();
        }
        Reply::ClaimAck {
            term: snapshot.term,
            accepted: snapshot.last_claim_accepted,
        }
    }

    /// Runs timers until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(node_id = %self.id, "Failover coordinator started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(POLL_INTERVAL) => self.tick().await,
            }
        }
        info!(node_id = %self.id, "Failover coordinator stopped");
    }

    /// One timer step: start an election, or send leader heartbeats when due.
    pub async fn tick(&self) {
        let now = Instant::now();
        if now < self.deadline() {
            return;
        }

        match self.view().role {
            Role::Follower | Role::Candidate => self.run_election().await,
            Role::Leader => self.broadcast_heartbeat().await,
        }
    }

    async fn run_election(&self) {
        let peers = self.peers();
        let timings = self.timings();
        let (snapshot, role) = self.handle(ElectionEvent::ElectionTimeout {
            electorate: peers.len() + 1,
            now: Utc::now(),
        });

        if role == Role::Leader {
            self.broadcast_heartbeat().await;
            return;
        }
        let Some(claim) = snapshot.claim else {
            self.reset_election_deadline();
            return;
        };

        let policy = RetryPolicy::no_retry(timings.candidacy_timeout);
        let mut ballots: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let payload = Payload::RequestVote {
                    claim: claim.clone(),
                };
                async move { self.comm.call_with_policy(&peer.address, payload, policy).await }
            })
            .collect();

        let counting = async {
            while let Some(result) = ballots.next().await {
                match result {
                    Ok(Reply::Vote {
                        voter,
                        term,
                        granted,
                    }) => {
                        let (_, role) = self.handle(ElectionEvent::VoteReceived {
                            voter,
                            term,
                            granted,
                        });
                        if role != Role::Candidate {
                            return role;
                        }
                    }
                    Ok(other) => debug!(node_id = %self.id, reply = ?other, "Unexpected vote reply"),
                    Err(e) => debug!(node_id = %self.id, error = %e, "Vote request failed"),
                }
            }
            self.view().role
        };

        let outcome = timeout(timings.candidacy_timeout, counting)
            .await
            .unwrap_or(Role::Candidate);

        match outcome {
            Role::Leader => self.broadcast_heartbeat().await,
            Role::Candidate => {
                let (_, role) = self.handle(ElectionEvent::CandidacyExpired);
                if role == Role::Follower {
                    self.set_deadline(Instant::now() + timings.random_backoff());
                }
            }
            Role::Follower => self.reset_election_deadline(),
        }
    }

    async fn broadcast_heartbeat(&self) {
        let timings = self.timings();
        self.set_deadline(Instant::now() + timings.heartbeat_interval);

        let Some(claim) = self.view().leader.filter(|claim| claim.candidate == self.id) else {
            return;
        };
        let policy = RetryPolicy::no_retry(timings.heartbeat_interval);
        let peers = self.peers();

        let mut acks: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let payload = Payload::LeaderHeartbeat {
                    claim: claim.clone(),
                };
                async move { self.comm.call_with_policy(&peer.address, payload, policy).await }
            })
            .collect();

        while let Some(result) = acks.next().await {
            if let Ok(Reply::ClaimAck { term, accepted: false }) = result {
                if term > claim.term {
                    let (_, role) = self.handle(ElectionEvent::HigherTermSeen { term });
                    if role == Role::Follower {
                        self.reset_election_deadline();
                        return;
                    }
                }
            }
        }
    }

    /// Feeds one event to the state machine and publishes the resulting view.
    fn handle(&self, event: ElectionEvent) -> (ElectionSnapshot, Role) {
        let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        let before = machine.inner().role();
        machine.handle(&event);
        let node = machine.inner();
        let snapshot = ElectionSnapshot::from(node);
        let role = node.role();
        drop(machine);

        if role == Role::Leader && before != Role::Leader {
            if let Some(claim) = snapshot.leader.clone() {
                self.promotions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(claim);
            }
        }
        if before == Role::Leader && role != Role::Leader {
            warn!(node_id = %self.id, term = %snapshot.term, "Lost leadership");
        }

        self.view.send_replace(ElectionView {
            node_id: self.id.clone(),
            role,
            term: snapshot.term,
            leader: snapshot.leader.clone(),
        });
        (snapshot, role)
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_deadline(&self, at: Instant) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    fn reset_election_deadline(&self) {
        let timeout = self.timings().random_election_timeout();
        self.set_deadline(Instant::now() + timeout);
    }
}

/// Copy of the election state taken right after an event.
#[derive(Debug, Clone)]
struct ElectionSnapshot {
    term: Term,
    leader: Option<LeaderClaim>,
    claim: Option<LeaderClaim>,
    last_vote: Option<VoteDecision>,
    last_claim_accepted: bool,
}

impl From<&ElectionNode> for ElectionSnapshot {
    fn from(node: &ElectionNode) -> Self {
        Self {
            term: node.term(),
            leader: node.leader_claim().cloned(),
            claim: node.claim().cloned(),
            last_vote: node.last_vote(),
            last_claim_accepted: node.last_claim_accepted(),
        }
    }
}
