//! Agent Registry
//!
//! Owns every known [`Agent`] and exposes only three mutations: `register`,
//! `heartbeat` and `sweep`. Entries live in a sharded map so updates for the
//! same agent are serialized by the entry lock while different agents proceed
//! in parallel. Readers always get copies.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{Agent, AgentId, AgentRegistration, AgentState, LoadSnapshot};
use crate::errors::RegistryError;

/// Liveness windows used by [`AgentRegistry::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Silence longer than this marks an agent SUSPECT.
    pub suspect_after: Duration,
    /// Silence longer than this marks a SUSPECT agent DEAD.
    pub dead_after: Duration,
    /// DEAD agents are kept this long for audit, then purged.
    pub purge_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            suspect_after: Duration::from_secs(15),
            dead_after: Duration::from_secs(45),
            purge_after: Duration::from_secs(300),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub suspected: Vec<AgentId>,
    pub dead: Vec<AgentId>,
    pub purged: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.dead.is_empty() && self.purged.is_empty()
    }
}

/// Number of agents per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub registered: usize,
    pub active: usize,
    pub suspect: usize,
    pub dead: usize,
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    liveness: RwLock<LivenessConfig>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}

impl AgentRegistry {
    pub fn new(liveness: LivenessConfig) -> Self {
        Self {
            agents: DashMap::new(),
            liveness: RwLock::new(liveness),
        }
    }

    pub fn liveness(&self) -> LivenessConfig {
        *self.liveness.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_liveness(&self, liveness: LivenessConfig) {
        *self.liveness.write().unwrap_or_else(|e| e.into_inner()) = liveness;
        info!(?liveness, "Registry liveness windows updated");
    }

    /// Adds a new agent or refreshes an existing one. Idempotent on id.
    ///
    /// A known agent keeps its lifecycle state, except that a DEAD agent comes
    /// back as REGISTERED.
    pub fn register(&self, registration: AgentRegistration, now: DateTime<Utc>) -> Agent {
        let id = registration.id.clone();
        let mut entry = self
            .agents
            .entry(id.clone())
            .or_insert_with(|| Agent::from_registration(registration.clone(), now));

        let agent = entry.value_mut();
        agent.location = registration.location;
        agent.tier = registration.tier;
        agent.capabilities = registration.capabilities;
        agent.address = registration.address;
        if agent.state == AgentState::Dead {
            agent.state = AgentState::Registered;
            agent.dead_since = None;
            agent.registered_at = now;
            agent.last_heartbeat = now;
            agent.load = None;
            info!(agent_id = %id, "Dead agent re-registered");
        } else {
            debug!(agent_id = %id, state = ?agent.state, "Agent registration refreshed");
        }

        agent.clone()
    }

    /// Records liveness and load for an agent, promoting it to ACTIVE.
    ///
    /// A snapshot older than the one already stored is ignored so a delayed
    /// heartbeat never overwrites fresher load data.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        snapshot: LoadSnapshot,
        now: DateTime<Utc>,
    ) -> Result<AgentState, RegistryError> {
        self.heartbeat_with(agent_id, snapshot, now, |_| {})
    }

    /// Like [`heartbeat`](Self::heartbeat), but runs `on_applied` with the
    /// stored snapshot while the agent's entry lock is still held.
    ///
    /// `on_applied` is skipped for stale snapshots, so anything derived from
    /// it sees samples in the same order as the registry.
    pub fn heartbeat_with<F>(
        &self,
        agent_id: &AgentId,
        snapshot: LoadSnapshot,
        now: DateTime<Utc>,
        on_applied: F,
    ) -> Result<AgentState, RegistryError>
    where
        F: FnOnce(&LoadSnapshot),
    {
        let mut entry =
            self.agents
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::UnknownAgent {
                    agent_id: agent_id.clone(),
                })?;
        let agent = entry.value_mut();

        if agent.state == AgentState::Dead {
            return Err(RegistryError::Deregistered {
                agent_id: agent_id.clone(),
            });
        }

        if let Some(current) = agent.load {
            if snapshot.timestamp < current.timestamp {
                debug!(
                    agent_id = %agent_id,
                    stale = %snapshot.timestamp,
                    current = %current.timestamp,
                    "Ignoring stale heartbeat"
                );
                return Ok(agent.state);
            }
        }

        let previous = agent.state;
        agent.last_heartbeat = agent.last_heartbeat.max(now);
        agent.load = Some(snapshot);
        agent.state = AgentState::Active;
        on_applied(&snapshot);

        if previous != AgentState::Active {
            info!(agent_id = %agent_id, from = ?previous, "Agent is active");
        }

        Ok(agent.state)
    }

    /// Applies the liveness windows at `now`.
    ///
    /// One sweep moves an agent at most one step along
    /// `Registered/Active -> Suspect -> Dead`, so DEAD is never reached without
    /// passing through SUSPECT.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let liveness = self.liveness();
        let mut report = SweepReport::default();

        for mut entry in self.agents.iter_mut() {
            let agent = entry.value_mut();
            let silence = (now - agent.last_heartbeat).to_std().unwrap_or_default();

            match agent.state {
                AgentState::Registered | AgentState::Active if silence > liveness.suspect_after => {
                    agent.state = AgentState::Suspect;
                    warn!(agent_id = %agent.id, silence_ms = silence.as_millis() as u64, "Agent suspected");
                    report.suspected.push(agent.id.clone());
                }
                AgentState::Suspect if silence > liveness.dead_after => {
                    agent.state = AgentState::Dead;
                    agent.dead_since = Some(now);
                    warn!(agent_id = %agent.id, silence_ms = silence.as_millis() as u64, "Agent declared dead");
                    report.dead.push(agent.id.clone());
                }
                _ => {}
            }
        }

        self.agents.retain(|id, agent| {
            let expired = agent.state == AgentState::Dead
                && agent
                    .dead_since
                    .and_then(|since| (now - since).to_std().ok())
                    .is_some_and(|held| held > liveness.purge_after);
            if expired {
                info!(agent_id = %id, "Purging dead agent");
                report.purged.push(id.clone());
            }
            !expired
        });

        report.suspected.sort();
        report.dead.sort();
        report.purged.sort();
        report
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Copy of every agent, ordered by id.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.agents.iter() {
            match entry.value().state {
                AgentState::Registered => counts.registered += 1,
                AgentState::Active => counts.active += 1,
                AgentState::Suspect => counts.suspect += 1,
                AgentState::Dead => counts.dead += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::{Capability, Tier};
    use chrono::Duration as ChronoDuration;

    fn registration(id: &str) -> AgentRegistration {
        AgentRegistration {
            id: AgentId::from(id),
            location: id.to_string(),
            tier: Tier::Edge,
            capabilities: [Capability::from("air_quality")].into_iter().collect(),
            address: format!("mem://{id}"),
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(LivenessConfig {
            suspect_after: Duration::from_secs(10),
            dead_after: Duration::from_secs(30),
            purge_after: Duration::from_secs(60),
        })
    }

    #[test]
    fn register_is_idempotent_on_id() {
        let registry = registry();
        let now = Utc::now();

        registry.register(registration("office"), now);
        let mut changed = registration("office");
        changed.location = "office-2".to_string();
        let agent = registry.register(changed, now);

        assert_eq!(registry.len(), 1);
        assert_eq!(agent.location, "office-2");
        assert_eq!(agent.state, AgentState::Registered);
    }

    #[test]
    fn heartbeat_activates_and_unknown_agents_are_rejected() {
        let registry = registry();
        let now = Utc::now();
        registry.register(registration("kitchen"), now);

        let state = registry
            .heartbeat(&AgentId::from("kitchen"), LoadSnapshot::idle(now), now)
            .unwrap();
        assert_eq!(state, AgentState::Active);

        let err = registry
            .heartbeat(&AgentId::from("garage"), LoadSnapshot::idle(now), now)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownAgent {
                agent_id: AgentId::from("garage")
            }
        );
    }

    #[test]
    fn stale_heartbeat_does_not_overwrite_fresher_load() {
        let registry = registry();
        let now = Utc::now();
        let id = AgentId::from("hallway");
        registry.register(registration("hallway"), now);

        let fresh = LoadSnapshot::new(0.5, 0.5, 4, now);
        let stale = LoadSnapshot::new(0.1, 0.1, 0, now - ChronoDuration::seconds(5));
        registry.heartbeat(&id, fresh, now).unwrap();
        registry.heartbeat(&id, stale, now).unwrap();

        assert_eq!(registry.get(&id).unwrap().load, Some(fresh));
    }

    #[test]
    fn stale_heartbeat_skips_the_applied_hook() {
        let registry = registry();
        let now = Utc::now();
        let id = AgentId::from("hallway");
        registry.register(registration("hallway"), now);

        let mut seen = Vec::new();
        let fresh = LoadSnapshot::new(0.1, 0.1, 0, now);
        let stale = LoadSnapshot::new(0.99, 0.99, 9, now - ChronoDuration::seconds(5));
        registry
            .heartbeat_with(&id, fresh, now, |load| seen.push(*load))
            .unwrap();
        let state = registry
            .heartbeat_with(&id, stale, now, |load| seen.push(*load))
            .unwrap();

        assert_eq!(state, AgentState::Active);
        assert_eq!(seen, vec![fresh]);
    }

    #[test]
    fn sweep_walks_through_suspect_before_dead() {
        let registry = registry();
        let t0 = Utc::now();
        let id = AgentId::from("office");
        registry.register(registration("office"), t0);
        registry.heartbeat(&id, LoadSnapshot::idle(t0), t0).unwrap();

        // Long silence still only suspects on the first sweep.
        let report = registry.sweep(t0 + ChronoDuration::seconds(100));
        assert_eq!(report.suspected, vec![id.clone()]);
        assert!(report.dead.is_empty());

        let report = registry.sweep(t0 + ChronoDuration::seconds(101));
        assert_eq!(report.dead, vec![id.clone()]);
        assert_eq!(registry.get(&id).unwrap().state, AgentState::Dead);

        let err = registry
            .heartbeat(&id, LoadSnapshot::idle(t0), t0 + ChronoDuration::seconds(102))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Deregistered { .. }));
    }

    #[test]
    fn suspect_agent_recovers_on_heartbeat() {
        let registry = registry();
        let t0 = Utc::now();
        let id = AgentId::from("kitchen");
        registry.register(registration("kitchen"), t0);
        registry.heartbeat(&id, LoadSnapshot::idle(t0), t0).unwrap();

        registry.sweep(t0 + ChronoDuration::seconds(11));
        assert_eq!(registry.get(&id).unwrap().state, AgentState::Suspect);

        let t1 = t0 + ChronoDuration::seconds(12);
        let state = registry.heartbeat(&id, LoadSnapshot::idle(t1), t1).unwrap();
        assert_eq!(state, AgentState::Active);
    }

    #[test]
    fn dead_agents_are_purged_after_grace_period() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register(registration("office"), t0);

        registry.sweep(t0 + ChronoDuration::seconds(11));
        let died_at = t0 + ChronoDuration::seconds(31);
        registry.sweep(died_at);
        assert_eq!(registry.state_counts().dead, 1);

        let report = registry.sweep(died_at + ChronoDuration::seconds(30));
        assert!(report.purged.is_empty());

        let report = registry.sweep(died_at + ChronoDuration::seconds(61));
        assert_eq!(report.purged, vec![AgentId::from("office")]);
        assert!(registry.is_empty());
    }

    #[test]
    fn dead_agent_can_register_again() {
        let registry = registry();
        let t0 = Utc::now();
        let id = AgentId::from("office");
        registry.register(registration("office"), t0);
        registry.sweep(t0 + ChronoDuration::seconds(11));
        registry.sweep(t0 + ChronoDuration::seconds(31));

        let agent = registry.register(registration("office"), t0 + ChronoDuration::seconds(32));
        assert_eq!(agent.state, AgentState::Registered);
        assert!(agent.dead_since.is_none());
    }

    #[test]
    fn list_returns_sorted_copies() {
        let registry = registry();
        let now = Utc::now();
        for id in ["office", "hallway", "kitchen"] {
            registry.register(registration(id), now);
        }

        let ids: Vec<String> = registry.list().into_iter().map(|a| a.id.0).collect();
        assert_eq!(ids, vec!["hallway", "kitchen", "office"]);
    }
}
