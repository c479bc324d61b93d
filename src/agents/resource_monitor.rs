//! Resource Monitor
//!
//! Turns raw [`LoadSnapshot`]s into per-agent [`Zone`]s and emits a
//! [`ZoneEvent`] whenever an agent's effective zone changes. Moving to a worse
//! zone takes effect immediately. Moving to a better zone only takes effect
//! once the load has stayed better for the debounce interval, so an agent
//! oscillating around a threshold does not flap in and out of placement.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::types::{AgentId, LoadSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Load classification gating allocation eligibility. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Zone {
    Normal,
    Pressured,
    Overloaded,
}

impl Zone {
    pub fn admits_placement(self) -> bool {
        !matches!(self, Zone::Overloaded)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Zone::Normal => "NORMAL",
            Zone::Pressured => "PRESSURED",
            Zone::Overloaded => "OVERLOADED",
        };
        f.write_str(name)
    }
}

/// Zone boundaries. All fractions are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneThresholds {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// Either fraction above this is OVERLOADED regardless of the other.
    pub hard_ceiling: f64,
    /// A queue deeper than this is OVERLOADED.
    pub queue_depth_ceiling: u32,
    pub debounce: Duration,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        Self {
            cpu_threshold: 0.8,
            memory_threshold: 0.85,
            hard_ceiling: 0.95,
            queue_depth_ceiling: 32,
            debounce: Duration::from_secs(10),
        }
    }
}

impl ZoneThresholds {
    pub fn classify(&self, snapshot: &LoadSnapshot) -> Zone {
        if snapshot.cpu_fraction > self.hard_ceiling
            || snapshot.memory_fraction > self.hard_ceiling
            || snapshot.queue_depth > self.queue_depth_ceiling
        {
            return Zone::Overloaded;
        }

        let cpu_high = snapshot.cpu_fraction > self.cpu_threshold;
        let memory_high = snapshot.memory_fraction > self.memory_threshold;
        match (cpu_high, memory_high) {
            (true, true) => Zone::Overloaded,
            (true, false) | (false, true) => Zone::Pressured,
            (false, false) => Zone::Normal,
        }
    }
}

/// Emitted whenever an agent's effective zone changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub agent_id: AgentId,
    pub from: Zone,
    pub to: Zone,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRelief {
    since: DateTime<Utc>,
    worst: Zone,
}

#[derive(Debug, Clone, Copy)]
struct ZoneTracker {
    effective: Zone,
    pending: Option<PendingRelief>,
}

impl ZoneTracker {
    fn new() -> Self {
        Self {
            effective: Zone::Normal,
            pending: None,
        }
    }

    /// Folds one raw classification in and returns the zone change, if any.
    fn apply(&mut self, raw: Zone, now: DateTime<Utc>, debounce: Duration) -> Option<(Zone, Zone)> {
        if raw > self.effective {
            let from = self.effective;
            self.effective = raw;
            self.pending = None;
            return Some((from, raw));
        }

        if raw == self.effective {
            self.pending = None;
            return None;
        }

        match self.pending.as_mut() {
            Some(pending) => pending.worst = pending.worst.max(raw),
            None => {
                self.pending = Some(PendingRelief {
                    since: now,
                    worst: raw,
                })
            }
        }
        self.release_if_due(now, debounce)
    }

    fn release_if_due(&mut self, now: DateTime<Utc>, debounce: Duration) -> Option<(Zone, Zone)> {
        let pending = self.pending?;
        let dwell = (now - pending.since).to_std().unwrap_or_default();
        if dwell < debounce {
            return None;
        }

        let from = self.effective;
        self.effective = pending.worst;
        self.pending = None;
        Some((from, pending.worst))
    }
}

#[derive(Debug)]
pub struct ResourceMonitor {
    trackers: DashMap<AgentId, ZoneTracker>,
    thresholds: RwLock<ZoneThresholds>,
    events: broadcast::Sender<ZoneEvent>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(ZoneThresholds::default())
    }
}

impl ResourceMonitor {
    pub fn new(thresholds: ZoneThresholds) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            trackers: DashMap::new(),
            thresholds: RwLock::new(thresholds),
            events,
        }
    }

    pub fn thresholds(&self) -> ZoneThresholds {
        *self.thresholds.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the thresholds. Current zones are kept until the next sample.
    pub fn update_thresholds(&self, thresholds: ZoneThresholds) {
        *self.thresholds.write().unwrap_or_else(|e| e.into_inner()) = thresholds;
        info!(
            cpu_threshold = thresholds.cpu_threshold,
            memory_threshold = thresholds.memory_threshold,
            hard_ceiling = thresholds.hard_ceiling,
            debounce_ms = thresholds.debounce.as_millis() as u64,
            "Zone thresholds updated"
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ZoneEvent> {
        self.events.subscribe()
    }

    /// Classifies a new sample for `agent_id`.
    pub fn observe(
        &self,
        agent_id: &AgentId,
        snapshot: &LoadSnapshot,
        now: DateTime<Utc>,
    ) -> Option<ZoneEvent> {
        let thresholds = self.thresholds();
        let raw = thresholds.classify(snapshot);

        let change = {
            let mut tracker = self
                .trackers
                .entry(agent_id.clone())
                .or_insert_with(ZoneTracker::new);
            tracker.apply(raw, now, thresholds.debounce)
        };

        debug!(agent_id = %agent_id, raw = %raw, cpu = snapshot.cpu_fraction, memory = snapshot.memory_fraction, "Load observed");
        change.map(|(from, to)| self.emit(agent_id, from, to, now))
    }

    /// Releases relief transitions whose debounce has elapsed without a new sample.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<ZoneEvent> {
        let debounce = self.thresholds().debounce;
        let mut changes = Vec::new();

        for mut entry in self.trackers.iter_mut() {
            if let Some((from, to)) = entry.value_mut().release_if_due(now, debounce) {
                changes.push((entry.key().clone(), from, to));
            }
        }

        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
            .into_iter()
            .map(|(agent_id, from, to)| self.emit(&agent_id, from, to, now))
            .collect()
    }

    /// Effective zone of an agent. Agents without samples are NORMAL.
    pub fn zone(&self, agent_id: &AgentId) -> Zone {
        self.trackers
            .get(agent_id)
            .map(|tracker| tracker.effective)
            .unwrap_or(Zone::Normal)
    }

    pub fn zones(&self) -> BTreeMap<AgentId, Zone> {
        self.trackers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().effective))
            .collect()
    }

    pub fn forget(&self, agent_id: &AgentId) {
        self.trackers.remove(agent_id);
    }

    fn emit(&self, agent_id: &AgentId, from: Zone, to: Zone, at: DateTime<Utc>) -> ZoneEvent {
        if to > from {
            warn!(agent_id = %agent_id, from = %from, to = %to, "Agent zone escalated");
        } else {
            info!(agent_id = %agent_id, from = %from, to = %to, "Agent zone relieved");
        }

        let event = ZoneEvent {
            agent_id: agent_id.clone(),
            from,
            to,
            at,
        };
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        event
    }
}
