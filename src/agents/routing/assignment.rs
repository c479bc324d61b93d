use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::agents::types::{AgentId, Tier};
use crate::tasks::{Placement, TaskId};

/// Handle on an in-flight placement. Resolves [`PlacementTicket::invalidated`]
/// once the bound agent is declared DEAD.
#[derive(Debug, Clone)]
pub struct PlacementTicket {
    pub placement: Placement,
    invalidated: Arc<Notify>,
}

impl PlacementTicket {
    pub async fn invalidated(&self) {
        self.invalidated.notified().await;
    }
}

#[derive(Debug)]
struct InFlight {
    placement: Placement,
    invalidated: Arc<Notify>,
}

/// Versioned record of every unresolved placement.
#[derive(Debug, Default)]
pub struct PlacementBook {
    next_version: AtomicU64,
    in_flight: DashMap<TaskId, InFlight>,
}

impl PlacementBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `task_id` to `agent_id` under a fresh version, replacing any
    /// previous binding for the task.
    pub fn record(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        tier: Tier,
        manual: bool,
        now: DateTime<Utc>,
    ) -> PlacementTicket {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let placement = Placement {
            task_id: task_id.clone(),
            agent_id,
            tier,
            version,
            decided_at: now,
            manual,
        };
        let invalidated = Arc::new(Notify::new());

        self.in_flight.insert(
            task_id,
            InFlight {
                placement: placement.clone(),
                invalidated: invalidated.clone(),
            },
        );
        debug!(task_id = %placement.task_id, agent_id = %placement.agent_id, version, "Placement recorded");

        PlacementTicket {
            placement,
            invalidated,
        }
    }

    /// Invalidates every placement bound to `agent_id` and returns the affected tasks.
    pub fn invalidate_agent(&self, agent_id: &AgentId) -> Vec<TaskId> {
        let mut affected = Vec::new();
        self.in_flight.retain(|task_id, entry| {
            if &entry.placement.agent_id != agent_id {
                return true;
            }
            // notify_one stores a permit when nobody is waiting yet.
            entry.invalidated.notify_one();
            affected.push(task_id.clone());
            false
        });

        if !affected.is_empty() {
            info!(agent_id = %agent_id, tasks = affected.len(), "Placements invalidated");
        }
        affected.sort();
        affected
    }

    /// Drops the binding if it is still at `version`.
    pub fn resolve(&self, task_id: &TaskId, version: u64) -> bool {
        self.in_flight
            .remove_if(task_id, |_, entry| entry.placement.version == version)
            .is_some()
    }

    pub fn current(&self, task_id: &TaskId) -> Option<Placement> {
        self.in_flight
            .get(task_id)
            .map(|entry| entry.placement.clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
