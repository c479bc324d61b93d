//! Error taxonomy shared by the orchestration core.
//!
//! Every variant carries a stable machine code so the REST surface can report
//! terminal failures without leaking formatting details.

use serde::Serialize;
use thiserror::Error;

use crate::agents::{AgentId, Capability};
use crate::failover::{NodeId, Term};
use crate::tasks::TaskId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no tier offers capability '{capability}'")]
    NoCapableAgent { capability: Capability },
    #[error("every agent offering '{capability}' is overloaded")]
    AllAgentsOverloaded { capability: Capability },
    #[error("task {task_id} missed its deadline before a placement resolved")]
    DeadlineExceeded { task_id: TaskId },
    #[error("task {task_id} gave up after {attempts} placements: {last_error}")]
    RetriesExhausted {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },
    #[error("manual placement on {agent_id} refused: {reason}")]
    InvalidOverride { agent_id: AgentId, reason: String },
}

impl AllocationError {
    /// Capacity problems clear up on their own; capability problems never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::AllAgentsOverloaded { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::NoCapableAgent { .. } => "NO_CAPABLE_AGENT",
            AllocationError::AllAgentsOverloaded { .. } => "ALL_AGENTS_OVERLOADED",
            AllocationError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            AllocationError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            AllocationError::InvalidOverride { .. } => "INVALID_OVERRIDE",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommunicationError {
    #[error("peer {peer} unreachable after {attempts} attempt(s)")]
    Unreachable { peer: String, attempts: u32 },
    #[error("peer {peer} did not answer within {after_ms}ms")]
    Timeout { peer: String, after_ms: u64 },
    #[error("request {request_id} already delivered")]
    DuplicateSuppressed { request_id: String },
    #[error("peer {peer} rejected the request: {reason}")]
    Rejected { peer: String, reason: String },
}

impl CommunicationError {
    /// Transient failures are retried inside the communication layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommunicationError::Unreachable { .. } | CommunicationError::Timeout { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            CommunicationError::Unreachable { .. } => "UNREACHABLE",
            CommunicationError::Timeout { .. } => "TIMEOUT",
            CommunicationError::DuplicateSuppressed { .. } => "DUPLICATE_SUPPRESSED",
            CommunicationError::Rejected { .. } => "REJECTED",
        }
    }
}

/// Election conflicts are steady-state events. They are logged, never returned
/// to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("split vote in term {term}: {votes} of {quorum} required votes")]
    SplitVote {
        term: Term,
        votes: usize,
        quorum: usize,
    },
    #[error("stepping down from term {from_term}: observed term {to_term}")]
    StepDown { from_term: Term, to_term: Term },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown agent {agent_id}")]
    UnknownAgent { agent_id: AgentId },
    #[error("agent {agent_id} was declared dead and must register again")]
    Deregistered { agent_id: AgentId },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::UnknownAgent { .. } => "UNKNOWN_AGENT",
            RegistryError::Deregistered { .. } => "DEREGISTERED",
        }
    }
}

/// Failures at task ingress on a supervisor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("this node is not the active supervisor (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotLeader { .. } => "NOT_LEADER",
            SupervisorError::InvalidTask { .. } => "INVALID_TASK",
            SupervisorError::Allocation(e) => e.code(),
        }
    }
}

/// Wire form of an error returned by the REST surface.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&SupervisorError> for ErrorBody {
    fn from(err: &SupervisorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&AllocationError> for ErrorBody {
    fn from(err: &AllocationError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&CommunicationError> for ErrorBody {
    fn from(err: &CommunicationError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
