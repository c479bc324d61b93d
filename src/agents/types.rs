use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable agent identity. Survives reconnects and re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Something an agent declares it can do, e.g. `local_inference` or `bme680`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Where an agent sits in the fleet. Escalation walks these in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Edge,
    EdgeServer,
    Cloud,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Edge => "edge",
            Tier::EdgeServer => "edge_server",
            Tier::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

/// Registry lifecycle of an agent.
///
/// The sweep-driven path is `Registered -> Active <-> Suspect -> Dead`; an
/// agent never reaches `Dead` without first being `Suspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Registered,
    Active,
    Suspect,
    Dead,
}

/// One load sample. Immutable; the next sample for the same agent supersedes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawLoadSnapshot")]
pub struct LoadSnapshot {
    pub cpu_fraction: f64,
    pub memory_fraction: f64,
    pub queue_depth: u32,
    pub timestamp: DateTime<Utc>,
}

impl LoadSnapshot {
    /// Fractions are clamped into `[0, 1]`; NaN counts as fully loaded.
    pub fn new(
        cpu_fraction: f64,
        memory_fraction: f64,
        queue_depth: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            cpu_fraction: clamp_fraction(cpu_fraction),
            memory_fraction: clamp_fraction(memory_fraction),
            queue_depth,
            timestamp,
        }
    }

    pub fn idle(timestamp: DateTime<Utc>) -> Self {
        Self::new(0.0, 0.0, 0, timestamp)
    }
}

/// Wire form of [`LoadSnapshot`] before clamping.
#[derive(Deserialize)]
struct RawLoadSnapshot {
    cpu_fraction: f64,
    memory_fraction: f64,
    queue_depth: u32,
    timestamp: DateTime<Utc>,
}

impl From<RawLoadSnapshot> for LoadSnapshot {
    fn from(raw: RawLoadSnapshot) -> Self {
        Self::new(raw.cpu_fraction, raw.memory_fraction, raw.queue_depth, raw.timestamp)
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        1.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// What an agent declares when it (re-)registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: AgentId,
    pub location: String,
    pub tier: Tier,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Base URL (or in-process address) the agent serves `/rpc` on.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub location: String,
    pub tier: Tier,
    pub capabilities: BTreeSet<Capability>,
    pub address: String,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub load: Option<LoadSnapshot>,
    pub dead_since: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn from_registration(registration: AgentRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: registration.id,
            location: registration.location,
            tier: registration.tier,
            capabilities: registration.capabilities,
            address: registration.address,
            state: AgentState::Registered,
            registered_at: now,
            last_heartbeat: now,
            load: None,
            dead_since: None,
        }
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn queue_depth(&self) -> u32 {
        self.load.map(|l| l.queue_depth).unwrap_or(0)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            location: self.location.clone(),
            tier: self.tier,
            state: self.state,
            last_load: self.load,
        }
    }
}

/// Row of `GET /agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub location: String,
    pub tier: Tier,
    pub state: AgentState,
    pub last_load: Option<LoadSnapshot>,
}
