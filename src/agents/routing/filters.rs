use std::collections::HashSet;

use crate::agents::resource_monitor::{ResourceMonitor, Zone};
use crate::agents::types::{Agent, AgentId, AgentState, Capability, Tier};

/// An agent that survived filtering, with the zone it was admitted under.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent: Agent,
    pub zone: Zone,
}

/// Narrows a registry snapshot down to the agents a task may be placed on.
#[derive(Debug, Default)]
pub struct CandidateFilter;

impl CandidateFilter {
    pub fn new() -> Self {
        Self
    }

    /// ACTIVE agents of `tier` declaring `capability`. SUSPECT, DEAD and
    /// never-heartbeated agents are never placement targets.
    pub fn capable<'a>(
        &self,
        agents: &'a [Agent],
        capability: &Capability,
        tier: Tier,
    ) -> Vec<&'a Agent> {
        agents
            .iter()
            .filter(|agent| agent.state == AgentState::Active)
            .filter(|agent| agent.tier == tier)
            .filter(|agent| agent.has_capability(capability))
            .collect()
    }

    /// Drops OVERLOADED agents.
    pub fn admissible(&self, capable: &[&Agent], monitor: &ResourceMonitor) -> Vec<Candidate> {
        capable
            .iter()
            .map(|agent| Candidate {
                agent: (*agent).clone(),
                zone: monitor.zone(&agent.id),
            })
            .filter(|candidate| candidate.zone.admits_placement())
            .collect()
    }

    /// Removes agents that already failed this task, unless that would leave nothing.
    pub fn avoid_failed(&self, candidates: Vec<Candidate>, avoid: &HashSet<AgentId>) -> Vec<Candidate> {
        if avoid.is_empty() {
            return candidates;
        }
        let (fresh, failed): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|candidate| !avoid.contains(&candidate.agent.id));
        if fresh.is_empty() {
            failed
        } else {
            fresh
        }
    }

    /// Keeps only agents at `location` when there are any.
    pub fn prefer_location(&self, candidates: Vec<Candidate>, location: Option<&str>) -> Vec<Candidate> {
        let Some(location) = location else {
            return candidates;
        };
        if !candidates.iter().any(|c| c.agent.location == location) {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|candidate| candidate.agent.location == location)
            .collect()
    }
}
