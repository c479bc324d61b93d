//! Wire messages carried by the communication layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{AgentId, AgentRegistration, AgentState, LoadSnapshot};
use crate::failover::{LeaderClaim, NodeId, Term};
use crate::tasks::{TaskId, TaskRequest};

/// Uniform wrapper around every remote call.
///
/// `request_id` is fixed for the lifetime of a logical call; retries only
/// bump `attempt`, so a receiver can recognise a redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    pub sender: String,
    pub attempt: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            attempt: 0,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Register {
        registration: AgentRegistration,
    },
    Heartbeat {
        agent_id: AgentId,
        load: LoadSnapshot,
    },
    Execute {
        task: TaskRequest,
        placement_version: u64,
    },
    RequestVote {
        claim: LeaderClaim,
    },
    LeaderHeartbeat {
        claim: LeaderClaim,
    },
}

impl Payload {
    /// One-way messages carry nothing worth replaying to the sender, so a
    /// redelivery is simply suppressed. Everything else replays the first reply.
    pub fn is_one_way(&self) -> bool {
        matches!(self, Payload::Heartbeat { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Register { .. } => "register",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Execute { .. } => "execute",
            Payload::RequestVote { .. } => "request_vote",
            Payload::LeaderHeartbeat { .. } => "leader_heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Registered {
        state: AgentState,
    },
    HeartbeatAccepted {
        state: AgentState,
    },
    /// The receiver no longer knows the sender; it must register again.
    RegistrationRequired {
        agent_id: AgentId,
    },
    Executed {
        task_id: TaskId,
        agent_id: AgentId,
        output: serde_json::Value,
    },
    Vote {
        voter: NodeId,
        term: Term,
        granted: bool,
    },
    ClaimAck {
        term: Term,
        accepted: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn payloads_are_tagged_by_type() {
        let envelope = Envelope::new(
            "kitchen",
            Payload::Heartbeat {
                agent_id: AgentId::from("kitchen"),
                load: LoadSnapshot::idle(Utc::now()),
            },
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"]["type"], "heartbeat");
        assert_eq!(json["attempt"], 0);

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
        assert!(back.payload.is_one_way());
    }
}
