use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::agents::{
    AgentId, AgentRegistration, Capability, EscalationPolicy, LivenessConfig, LoadScorer, Tier,
    ZoneThresholds,
};
use crate::comm::{RequestWindow, RetryPolicy};
use crate::failover::{ElectionTimings, NodeId, Peer};
use crate::supervisor::{DispatchSettings, SupervisorSettings};

/// Main configuration structure for a fleet node.
///
/// Every section has defaults, so a configuration file only needs the keys
/// it changes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    pub node: NodeConfig,
    pub observability: ObservabilityConfig,
    pub resources: ResourcesConfig,
    pub allocation: AllocationConfig,
    pub communication: CommunicationConfig,
    pub failover: FailoverConfig,
    pub liveness: LivenessSection,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id. Defaults to the host name.
    pub id: Option<String>,
    /// Socket address the HTTP surface listens on
    pub bind: String,
    /// Base URL peers and agents use to reach this node
    pub advertise: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            bind: "0.0.0.0:8080".to_string(),
            advertise: None,
        }
    }
}

impl NodeConfig {
    pub fn resolved_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "fleet-node".to_string())
        })
    }

    pub fn advertise_address(&self) -> String {
        self.advertise
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, overridden by `RUST_LOG`
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub hard_ceiling: f64,
    pub queue_depth_ceiling: u32,
    pub debounce_ms: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        let thresholds = ZoneThresholds::default();
        Self {
            cpu_threshold: thresholds.cpu_threshold,
            memory_threshold: thresholds.memory_threshold,
            hard_ceiling: thresholds.hard_ceiling,
            queue_depth_ceiling: thresholds.queue_depth_ceiling,
            debounce_ms: thresholds.debounce.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Re-allocations after the first placement
    pub retry_attempts: u32,
    pub overload_cooldown_ms: u64,
    pub cpu_weight: f64,
    pub memory_weight: f64,
    pub queue_weight: f64,
    pub queue_norm: u32,
    /// Default tier fallback order
    pub escalation: Vec<Tier>,
    /// Per-capability fallback orders. Keys are matched lowercased.
    pub per_capability: BTreeMap<String, Vec<Tier>>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        let scorer = LoadScorer::default();
        let dispatch = DispatchSettings::default();
        Self {
            retry_attempts: dispatch.retry_attempts,
            overload_cooldown_ms: dispatch.overload_cooldown.as_millis() as u64,
            cpu_weight: scorer.cpu_weight,
            memory_weight: scorer.memory_weight,
            queue_weight: scorer.queue_weight,
            queue_norm: scorer.queue_norm,
            escalation: EscalationPolicy::default().default_order,
            per_capability: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Request ids remembered for de-duplication
    pub dedup_capacity: u64,
    pub dedup_ttl_secs: u64,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            timeout_ms: policy.timeout.as_millis() as u64,
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            backoff_factor: policy.backoff_factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
            dedup_capacity: 10_000,
            dedup_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub candidacy_timeout_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Other supervisor-capable nodes. This node may appear; it is ignored.
    pub peers: Vec<Peer>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        let timings = ElectionTimings::default();
        Self {
            election_timeout_min_ms: timings.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: timings.election_timeout_max.as_millis() as u64,
            heartbeat_interval_ms: timings.heartbeat_interval.as_millis() as u64,
            candidacy_timeout_ms: timings.candidacy_timeout.as_millis() as u64,
            retry_backoff_max_ms: timings.retry_backoff_max.as_millis() as u64,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessSection {
    pub suspect_after_secs: u64,
    pub dead_after_secs: u64,
    pub purge_after_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        let liveness = LivenessConfig::default();
        Self {
            suspect_after_secs: liveness.suspect_after.as_secs(),
            dead_after_secs: liveness.dead_after.as_secs(),
            purge_after_secs: liveness.purge_after.as_secs(),
            sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub location: String,
    pub tier: Tier,
    pub capabilities: Vec<String>,
    /// Base URLs of every supervisor-capable node
    pub supervisors: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub sensor_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            location: "default".to_string(),
            tier: Tier::Edge,
            capabilities: Vec::new(),
            supervisors: Vec::new(),
            heartbeat_interval_secs: 5,
            sensor_capacity: 1000,
        }
    }
}

impl FleetConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`path`, else `fleet-supervisor.toml` if present)
    /// 3. Environment variables (`FLEET_SECTION__KEY`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_env_file()?;

        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new("fleet-supervisor.toml").exists() => {
                builder = builder.add_source(File::with_name("fleet-supervisor"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.capabilities")
                .with_list_parse_key("worker.supervisors")
                .try_parsing(true),
        );

        let fleet_config: FleetConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid fleet configuration")?;
        fleet_config.validate()?;
        Ok(fleet_config)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Rejects values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.resources;
        for (name, value) in [
            ("resources.cpu_threshold", r.cpu_threshold),
            ("resources.memory_threshold", r.memory_threshold),
            ("resources.hard_ceiling", r.hard_ceiling),
        ] {
            ensure!(value > 0.0 && value <= 1.0, "{name} must be in (0, 1], got {value}");
        }
        ensure!(
            r.hard_ceiling >= r.cpu_threshold && r.hard_ceiling >= r.memory_threshold,
            "resources.hard_ceiling must not be below the zone thresholds"
        );

        let a = &self.allocation;
        ensure!(!a.escalation.is_empty(), "allocation.escalation must name at least one tier");
        ensure!(
            a.cpu_weight >= 0.0 && a.memory_weight >= 0.0 && a.queue_weight >= 0.0,
            "allocation weights must not be negative"
        );
        ensure!(a.queue_norm > 0, "allocation.queue_norm must be positive");

        let c = &self.communication;
        ensure!(c.timeout_ms > 0, "communication.timeout_ms must be positive");
        ensure!(c.backoff_factor >= 1.0, "communication.backoff_factor must be at least 1");
        ensure!(c.dedup_capacity > 0, "communication.dedup_capacity must be positive");

        let f = &self.failover;
        ensure!(
            f.election_timeout_min_ms <= f.election_timeout_max_ms,
            "failover.election_timeout_min_ms exceeds election_timeout_max_ms"
        );
        ensure!(
            f.heartbeat_interval_ms < f.election_timeout_min_ms,
            "failover.heartbeat_interval_ms must be shorter than the election timeout"
        );

        let l = &self.liveness;
        ensure!(l.suspect_after_secs > 0, "liveness.suspect_after_secs must be positive");
        ensure!(
            l.dead_after_secs > l.suspect_after_secs,
            "liveness.dead_after_secs must exceed suspect_after_secs"
        );
        ensure!(l.sweep_interval_ms > 0, "liveness.sweep_interval_ms must be positive");

        ensure!(
            self.worker.heartbeat_interval_secs > 0,
            "worker.heartbeat_interval_secs must be positive"
        );
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.resolved_id())
    }

    pub fn zone_thresholds(&self) -> ZoneThresholds {
        let r = &self.resources;
        ZoneThresholds {
            cpu_threshold: r.cpu_threshold,
            memory_threshold: r.memory_threshold,
            hard_ceiling: r.hard_ceiling,
            queue_depth_ceiling: r.queue_depth_ceiling,
            debounce: Duration::from_millis(r.debounce_ms),
        }
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        let a = &self.allocation;
        EscalationPolicy {
            default_order: a.escalation.clone(),
            per_capability: a
                .per_capability
                .iter()
                .map(|(capability, order)| (Capability::new(capability.clone()), order.clone()))
                .collect(),
        }
    }

    pub fn load_scorer(&self) -> LoadScorer {
        let a = &self.allocation;
        LoadScorer {
            cpu_weight: a.cpu_weight,
            memory_weight: a.memory_weight,
            queue_weight: a.queue_weight,
            queue_norm: a.queue_norm,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            retry_attempts: self.allocation.retry_attempts,
            overload_cooldown: Duration::from_millis(self.allocation.overload_cooldown_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let c = &self.communication;
        RetryPolicy {
            max_retries: c.max_retries,
            base_delay: Duration::from_millis(c.base_delay_ms),
            backoff_factor: c.backoff_factor,
            max_delay: Duration::from_millis(c.max_delay_ms),
            timeout: Duration::from_millis(c.timeout_ms),
            jitter: c.jitter,
        }
    }

    pub fn request_window(&self) -> RequestWindow {
        RequestWindow::new(
            self.communication.dedup_capacity,
            Duration::from_secs(self.communication.dedup_ttl_secs),
        )
    }

    pub fn election_timings(&self) -> ElectionTimings {
        let f = &self.failover;
        ElectionTimings {
            election_timeout_min: Duration::from_millis(f.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(f.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(f.heartbeat_interval_ms),
            candidacy_timeout: Duration::from_millis(f.candidacy_timeout_ms),
            retry_backoff_max: Duration::from_millis(f.retry_backoff_max_ms),
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        let l = &self.liveness;
        LivenessConfig {
            suspect_after: Duration::from_secs(l.suspect_after_secs),
            dead_after: Duration::from_secs(l.dead_after_secs),
            purge_after: Duration::from_secs(l.purge_after_secs),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            liveness: self.liveness_config(),
            sweep_interval: Duration::from_millis(self.liveness.sweep_interval_ms),
            thresholds: self.zone_thresholds(),
            escalation: self.escalation_policy(),
            scorer: self.load_scorer(),
            dispatch: self.dispatch_settings(),
            retry: self.retry_policy(),
            election: self.election_timings(),
            peers: self.failover.peers.clone(),
            ..SupervisorSettings::default()
        }
    }

    /// What a worker started from this configuration registers as.
    pub fn agent_registration(&self) -> AgentRegistration {
        AgentRegistration {
            id: AgentId::new(self.node.resolved_id()),
            location: self.worker.location.clone(),
            tier: self.worker.tier,
            capabilities: self
                .worker
                .capabilities
                .iter()
                .map(|name| Capability::new(name.clone()))
                .collect::<BTreeSet<_>>(),
            address: self.node.advertise_address(),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
