//! Drives a task from placement to result, re-allocating when the bound agent
//! dies or fails, until the task succeeds, runs out of placements, or misses
//! its deadline.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{info, warn, Instrument};

use crate::agents::{AgentId, AgentRegistry, PlacementTicket, TaskAllocator};
use crate::comm::{CommunicationLayer, Payload, Reply};
use crate::errors::AllocationError;
use crate::tasks::{TaskOutcome, TaskRequest};
use crate::telemetry::{create_coordination_span, generate_correlation_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Re-allocations allowed after the first placement.
    pub retry_attempts: u32,
    /// Pause before retrying when every capable agent is overloaded.
    pub overload_cooldown: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            overload_cooldown: Duration::from_secs(2),
        }
    }
}

/// Where a dispatch begins.
#[derive(Debug)]
pub enum DispatchStart {
    /// The allocator chooses right away.
    Fresh,
    /// A placement already recorded at submission.
    Placed(PlacementTicket),
    /// Submission found every capable agent overloaded. That reservation
    /// counts as the first placement and the cooldown runs before the next.
    Overloaded,
}

enum AttemptResult {
    Done(TaskOutcome),
    Failed(String),
}

pub struct TaskDispatcher {
    allocator: Arc<TaskAllocator>,
    registry: Arc<AgentRegistry>,
    comm: Arc<CommunicationLayer>,
    settings: RwLock<DispatchSettings>,
}

impl TaskDispatcher {
    pub fn new(
        allocator: Arc<TaskAllocator>,
        registry: Arc<AgentRegistry>,
        comm: Arc<CommunicationLayer>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            allocator,
            registry,
            comm,
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_settings(&self, settings: DispatchSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Runs `request` to completion from `start`.
    pub async fn dispatch(&self, request: TaskRequest, start: DispatchStart) -> Result<TaskOutcome, AllocationError> {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span("dispatch_task", None, Some(request.id.as_str()), Some(&correlation_id));
        let task_id = request.id.clone();

        let Some(deadline) = request.deadline else {
            return self.place_until_done(request, start).instrument(span).await;
        };

        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        match timeout_at(Instant::now() + remaining, self.place_until_done(request, start))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                if let Some(placement) = self.allocator.current_placement(&task_id) {
                    self.allocator.resolve(&placement);
                }
                warn!(task_id = %task_id, "Task deadline elapsed, dispatch cancelled");
                Err(AllocationError::DeadlineExceeded { task_id })
            }
        }
    }

    async fn place_until_done(
        &self,
        mut request: TaskRequest,
        start: DispatchStart,
    ) -> Result<TaskOutcome, AllocationError> {
        let settings = self.settings();
        let ceiling = settings.retry_attempts.saturating_add(1);
        let mut avoid: HashSet<AgentId> = HashSet::new();
        let mut placements = 0u32;
        let mut last_error = String::from("no placement attempted");

        let mut first = match start {
            DispatchStart::Fresh => None,
            DispatchStart::Placed(ticket) => Some(ticket),
            DispatchStart::Overloaded => {
                placements = 1;
                last_error = String::from("every capable agent overloaded");
                if placements < ceiling {
                    self.cool_down(&request, settings.overload_cooldown).await;
                }
                None
            }
        };

        loop {
            if request.is_expired(Utc::now()) {
                return Err(AllocationError::DeadlineExceeded {
                    task_id: request.id.clone(),
                });
            }
            if placements >= ceiling {
                warn!(task_id = %request.id, placements, "Giving up on task");
                return Err(AllocationError::RetriesExhausted {
                    task_id: request.id.clone(),
                    attempts: placements,
                    last_error,
                });
            }

            let ticket = match first.take() {
                Some(ticket) => ticket,
                None => match self.allocator.reserve(&request, &avoid, Utc::now()) {
                    Ok(ticket) => ticket,
                    Err(e) if e.is_retryable() => {
                        placements += 1;
                        if placements >= ceiling {
                            return Err(e);
                        }
                        last_error = e.to_string();
                        self.cool_down(&request, settings.overload_cooldown).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };
            placements += 1;

            let agent_id = ticket.placement.agent_id.clone();
            match self.attempt(&request, &ticket, placements).await {
                AttemptResult::Done(outcome) => return Ok(outcome),
                AttemptResult::Failed(reason) => {
                    warn!(task_id = %request.id, agent_id = %agent_id, version = ticket.placement.version, reason = %reason, "Placement failed, re-allocating");
                    self.allocator.resolve(&ticket.placement);
                    avoid.insert(agent_id);
                    request.retry_count += 1;
                    last_error = reason;
                }
            }
        }
    }

    async fn cool_down(&self, request: &TaskRequest, cooldown: Duration) {
        info!(task_id = %request.id, cooldown_ms = cooldown.as_millis() as u64, "Fleet overloaded, cooling down");
        sleep(cooldown).await;
    }

    async fn attempt(&self, request: &TaskRequest, ticket: &PlacementTicket, placements: u32) -> AttemptResult {
        let placement = &ticket.placement;
        let Some(agent) = self.registry.get(&placement.agent_id) else {
            return AttemptResult::Failed(format!("agent {} is no longer registered", placement.agent_id));
        };

        let call = self.comm.call(
            &agent.address,
            Payload::Execute {
                task: request.clone(),
                placement_version: placement.version,
            },
        );

        // A result that races the invalidation still counts.
        let result = tokio::select! {
            biased;
            result = call => Some(result),
            _ = ticket.invalidated() => None,
        };

        match result {
            Some(Ok(Reply::Executed { output, .. })) => {
                self.allocator.resolve(placement);
                info!(task_id = %request.id, agent_id = %placement.agent_id, placements, "Task completed");
                AttemptResult::Done(TaskOutcome {
                    task_id: request.id.clone(),
                    agent_id: placement.agent_id.clone(),
                    placement_version: placement.version,
                    attempts: placements,
                    output,
                })
            }
            Some(Ok(other)) => AttemptResult::Failed(format!("unexpected reply {other:?}")),
            Some(Err(e)) => AttemptResult::Failed(e.to_string()),
            None => AttemptResult::Failed(format!("agent {} declared dead", placement.agent_id)),
        }
    }
}
