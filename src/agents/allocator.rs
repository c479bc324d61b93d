//! Task Allocator
//!
//! Placement walks the escalation tiers for the required capability in
//! order. Inside a tier it keeps ACTIVE, capable, non-OVERLOADED agents,
//! prefers the task's location, and takes the best-ranked survivor. Decisions
//! read only copies of registry and monitor state, so identical state always
//! yields the identical agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::registry::AgentRegistry;
use super::resource_monitor::ResourceMonitor;
use super::routing::{CandidateFilter, LoadScorer, PlacementBook, PlacementTicket};
use super::types::{AgentId, AgentState, Capability, Tier};
use crate::errors::AllocationError;
use crate::tasks::{Placement, TaskId, TaskRequest};

/// Ordered tier fallback, with optional per-capability lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub default_order: Vec<Tier>,
    #[serde(default)]
    pub per_capability: BTreeMap<Capability, Vec<Tier>>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            default_order: vec![Tier::Edge, Tier::EdgeServer, Tier::Cloud],
            per_capability: BTreeMap::new(),
        }
    }
}

impl EscalationPolicy {
    pub fn with_override(mut self, capability: Capability, order: Vec<Tier>) -> Self {
        self.per_capability.insert(capability, order);
        self
    }

    pub fn tiers_for(&self, capability: &Capability) -> &[Tier] {
        self.per_capability
            .get(capability)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_order)
    }
}

/// Result of the pure placement decision, before it is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub agent_id: AgentId,
    pub tier: Tier,
}

#[derive(Debug)]
pub struct TaskAllocator {
    registry: Arc<AgentRegistry>,
    monitor: Arc<ResourceMonitor>,
    policy: RwLock<EscalationPolicy>,
    scorer: RwLock<LoadScorer>,
    filter: CandidateFilter,
    book: PlacementBook,
}

impl TaskAllocator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        monitor: Arc<ResourceMonitor>,
        policy: EscalationPolicy,
        scorer: LoadScorer,
    ) -> Self {
        Self {
            registry,
            monitor,
            policy: RwLock::new(policy),
            scorer: RwLock::new(scorer),
            filter: CandidateFilter::new(),
            book: PlacementBook::new(),
        }
    }

    pub fn set_policy(&self, policy: EscalationPolicy) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
        info!("Escalation policy updated");
    }

    pub fn set_scorer(&self, scorer: LoadScorer) {
        *self.scorer.write().unwrap_or_else(|e| e.into_inner()) = scorer;
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Chooses an agent without recording anything.
    ///
    /// `avoid` holds agents that already failed this task; they are passed
    /// over whenever the tier has another admissible agent.
    pub fn decide(
        &self,
        request: &TaskRequest,
        avoid: &HashSet<AgentId>,
    ) -> Result<PlacementDecision, AllocationError> {
        let capability = &request.required_capability;
        let agents = self.registry.list();
        let policy = self.policy();
        let scorer = *self.scorer.read().unwrap_or_else(|e| e.into_inner());
        let mut saw_capable = false;

        for &tier in policy.tiers_for(capability) {
            let capable = self.filter.capable(&agents, capability, tier);
            if capable.is_empty() {
                continue;
            }
            saw_capable = true;

            let admissible = self.filter.admissible(&capable, &self.monitor);
            if admissible.is_empty() {
                debug!(task_id = %request.id, tier = %tier, "Every capable agent in tier is overloaded, escalating");
                continue;
            }

            let candidates = self.filter.avoid_failed(admissible, avoid);
            let candidates = self.filter.prefer_location(candidates, request.preferred_location());
            if let Some(best) = scorer.rank(candidates).into_iter().next() {
                return Ok(PlacementDecision {
                    agent_id: best.agent.id,
                    tier,
                });
            }
        }

        if saw_capable {
            Err(AllocationError::AllAgentsOverloaded {
                capability: capability.clone(),
            })
        } else {
            Err(AllocationError::NoCapableAgent {
                capability: capability.clone(),
            })
        }
    }

    /// Decides and records a placement for `request`.
    pub fn allocate(&self, request: &TaskRequest) -> Result<Placement, AllocationError> {
        self.reserve(request, &HashSet::new(), Utc::now())
            .map(|ticket| ticket.placement)
    }

    /// Decides and records a placement, returning a ticket that fires if the
    /// chosen agent dies before the task resolves.
    pub fn reserve(
        &self,
        request: &TaskRequest,
        avoid: &HashSet<AgentId>,
        now: DateTime<Utc>,
    ) -> Result<PlacementTicket, AllocationError> {
        if request.is_expired(now) {
            return Err(AllocationError::DeadlineExceeded {
                task_id: request.id.clone(),
            });
        }

        let decision = self.decide(request, avoid)?;
        let ticket = self
            .book
            .record(request.id.clone(), decision.agent_id, decision.tier, false, now);
        self.recheck(&ticket);

        info!(
            task_id = %request.id,
            agent_id = %ticket.placement.agent_id,
            tier = %ticket.placement.tier,
            version = ticket.placement.version,
            "Task placed"
        );
        Ok(ticket)
    }

    /// Operator placement. Skips scoring but still requires an ACTIVE target.
    pub fn place_manually(
        &self,
        request: &TaskRequest,
        agent_id: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<PlacementTicket, AllocationError> {
        let agent = self
            .registry
            .get(agent_id)
            .ok_or_else(|| AllocationError::InvalidOverride {
                agent_id: agent_id.clone(),
                reason: "agent is not registered".to_string(),
            })?;
        if agent.state != AgentState::Active {
            return Err(AllocationError::InvalidOverride {
                agent_id: agent_id.clone(),
                reason: format!("agent state is {:?}", agent.state),
            });
        }

        let ticket = self
            .book
            .record(request.id.clone(), agent.id, agent.tier, true, now);
        self.recheck(&ticket);
        warn!(task_id = %request.id, agent_id = %agent_id, version = ticket.placement.version, "Manual placement override");
        Ok(ticket)
    }

    /// Invalidates in-flight placements on an agent that just died.
    pub fn invalidate_agent(&self, agent_id: &AgentId) -> Vec<TaskId> {
        self.book.invalidate_agent(agent_id)
    }

    pub fn resolve(&self, placement: &Placement) -> bool {
        self.book.resolve(&placement.task_id, placement.version)
    }

    pub fn current_placement(&self, task_id: &TaskId) -> Option<Placement> {
        self.book.current(task_id)
    }

    pub fn in_flight(&self) -> usize {
        self.book.in_flight_count()
    }

    // The agent may have been swept between the decision and the record.
    fn recheck(&self, ticket: &PlacementTicket) {
        let dead = self
            .registry
            .get(&ticket.placement.agent_id)
            .map(|agent| agent.state == AgentState::Dead)
            .unwrap_or(true);
        if dead {
            self.book.invalidate_agent(&ticket.placement.agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::registry::LivenessConfig;
    use crate::agents::resource_monitor::ZoneThresholds;
    use crate::agents::types::{AgentRegistration, LoadSnapshot};
    use crate::tasks::TaskPayload;

    struct Fleet {
        registry: Arc<AgentRegistry>,
        monitor: Arc<ResourceMonitor>,
        allocator: TaskAllocator,
    }

    impl Fleet {
        fn new() -> Self {
            let registry = Arc::new(AgentRegistry::new(LivenessConfig::default()));
            let monitor = Arc::new(ResourceMonitor::new(ZoneThresholds::default()));
            let allocator = TaskAllocator::new(
                registry.clone(),
                monitor.clone(),
                EscalationPolicy::default(),
                LoadScorer::default(),
            );
            Self {
                registry,
                monitor,
                allocator,
            }
        }

        fn add(&self, id: &str, tier: Tier, capability: &str, cpu: f64, memory: f64) {
            let now = Utc::now();
            self.registry.register(
                AgentRegistration {
                    id: AgentId::from(id),
                    location: id.to_string(),
                    tier,
                    capabilities: [Capability::from(capability)].into_iter().collect(),
                    address: format!("mem://{id}"),
                },
                now,
            );
            let snapshot = LoadSnapshot::new(cpu, memory, 0, now);
            self.registry
                .heartbeat(&AgentId::from(id), snapshot, now)
                .unwrap();
            self.monitor.observe(&AgentId::from(id), &snapshot, now);
        }
    }

    fn request(capability: &str) -> TaskRequest {
        TaskRequest::new(Capability::from(capability), TaskPayload::default())
    }

    #[test]
    fn picks_lowest_id_when_load_is_equal() {
        let fleet = Fleet::new();
        for id in ["office", "kitchen", "hallway"] {
            fleet.add(id, Tier::Edge, "air_quality", 0.2, 0.2);
        }

        let placement = fleet.allocator.allocate(&request("air_quality")).unwrap();
        assert_eq!(placement.agent_id, AgentId::from("hallway"));
        assert_eq!(placement.tier, Tier::Edge);
    }

    #[test]
    fn decisions_are_deterministic() {
        let fleet = Fleet::new();
        fleet.add("office", Tier::Edge, "air_quality", 0.3, 0.2);
        fleet.add("kitchen", Tier::Edge, "air_quality", 0.1, 0.5);
        let task = request("air_quality");

        let first = fleet.allocator.decide(&task, &HashSet::new()).unwrap();
        for _ in 0..10 {
            assert_eq!(fleet.allocator.decide(&task, &HashSet::new()).unwrap(), first);
        }
    }

    #[test]
    fn escalates_to_next_tier_when_edge_is_overloaded() {
        let fleet = Fleet::new();
        fleet.add("office", Tier::Edge, "air_quality", 0.99, 0.99);
        fleet.add("cloud-1", Tier::Cloud, "air_quality", 0.5, 0.5);

        let decision = fleet
            .allocator
            .decide(&request("air_quality"), &HashSet::new())
            .unwrap();
        assert_eq!(decision.agent_id, AgentId::from("cloud-1"));
        assert_eq!(decision.tier, Tier::Cloud);
    }

    #[test]
    fn reports_overload_versus_missing_capability() {
        let fleet = Fleet::new();
        fleet.add("office", Tier::Edge, "air_quality", 0.99, 0.99);

        let overloaded = fleet
            .allocator
            .decide(&request("air_quality"), &HashSet::new())
            .unwrap_err();
        assert!(matches!(overloaded, AllocationError::AllAgentsOverloaded { .. }));

        let missing = fleet
            .allocator
            .decide(&request("noise"), &HashSet::new())
            .unwrap_err();
        assert!(matches!(missing, AllocationError::NoCapableAgent { .. }));
    }

    #[test]
    fn per_capability_policy_restricts_tiers() {
        let fleet = Fleet::new();
        fleet.add("cloud-1", Tier::Cloud, "local_inference", 0.1, 0.1);
        fleet.allocator.set_policy(
            EscalationPolicy::default()
                .with_override(Capability::from("local_inference"), vec![Tier::Edge]),
        );

        let err = fleet
            .allocator
            .decide(&request("local_inference"), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocationError::NoCapableAgent { .. }));
    }

    #[test]
    fn location_preference_beats_lower_load() {
        let fleet = Fleet::new();
        fleet.add("hallway", Tier::Edge, "air_quality", 0.1, 0.1);
        fleet.add("office", Tier::Edge, "air_quality", 0.5, 0.5);

        let mut task = request("air_quality");
        task.payload.location = Some("office".to_string());
        let decision = fleet.allocator.decide(&task, &HashSet::new()).unwrap();
        assert_eq!(decision.agent_id, AgentId::from("office"));
    }

    #[test]
    fn expired_requests_are_not_placed() {
        let fleet = Fleet::new();
        fleet.add("office", Tier::Edge, "air_quality", 0.1, 0.1);
        let task = request("air_quality").with_deadline(Utc::now() - chrono::Duration::seconds(1));

        let err = fleet.allocator.allocate(&task).unwrap_err();
        assert!(matches!(err, AllocationError::DeadlineExceeded { .. }));
    }

    #[test]
    fn manual_placement_rejects_unknown_agents() {
        let fleet = Fleet::new();
        fleet.add("office", Tier::Edge, "air_quality", 0.99, 0.99);
        let task = request("air_quality");

        let ticket = fleet
            .allocator
            .place_manually(&task, &AgentId::from("office"), Utc::now())
            .unwrap();
        assert!(ticket.placement.manual);

        let err = fleet
            .allocator
            .place_manually(&task, &AgentId::from("garage"), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_OVERRIDE");
    }

    #[test]
    fn manual_placement_requires_an_active_agent() {
        let fleet = Fleet::new();
        let t0 = Utc::now();
        fleet.add("kitchen", Tier::Edge, "air_quality", 0.1, 0.1);
        fleet.registry.register(
            AgentRegistration {
                id: AgentId::from("hallway"),
                location: "hallway".to_string(),
                tier: Tier::Edge,
                capabilities: [Capability::from("air_quality")].into_iter().collect(),
                address: "mem://hallway".to_string(),
            },
            t0,
        );
        let task = request("air_quality");

        let registered = fleet
            .allocator
            .place_manually(&task, &AgentId::from("hallway"), t0)
            .unwrap_err();
        assert!(matches!(registered, AllocationError::InvalidOverride { .. }));

        let later = t0 + chrono::Duration::seconds(20);
        let report = fleet.registry.sweep(later);
        assert!(report.suspected.contains(&AgentId::from("kitchen")));

        let suspect = fleet
            .allocator
            .place_manually(&task, &AgentId::from("kitchen"), later)
            .unwrap_err();
        assert!(matches!(
            suspect,
            AllocationError::InvalidOverride { ref agent_id, .. } if agent_id == &AgentId::from("kitchen")
        ));
        assert_eq!(fleet.allocator.in_flight(), 0);
    }
}
