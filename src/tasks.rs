//! Task requests, placements and outcomes.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::agents::{AgentId, Capability, Tier};
use crate::errors::SupervisorError;

/// Task identity. Never reused; a resubmission gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque work description handed to the executing agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    pub query: String,
    /// Preferred agent location, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub required_capability: Capability,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resubmission_of: Option<TaskId>,
}

impl TaskRequest {
    pub fn new(required_capability: Capability, payload: TaskPayload) -> Self {
        Self {
            id: TaskId::generate(),
            payload,
            required_capability,
            submitted_at: Utc::now(),
            deadline: None,
            retry_count: 0,
            resubmission_of: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A new request for the same work, pointing back at this one.
    pub fn resubmit(&self) -> Self {
        Self {
            id: TaskId::generate(),
            payload: self.payload.clone(),
            required_capability: self.required_capability.clone(),
            submitted_at: Utc::now(),
            deadline: None,
            retry_count: 0,
            resubmission_of: Some(self.id.clone()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn preferred_location(&self) -> Option<&str> {
        self.payload.location.as_deref()
    }
}

/// Body of `POST /task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub capability: Capability,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
    /// Relative deadline from submission.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub resubmission_of: Option<TaskId>,
}

impl TaskDescriptor {
    /// Stamps the descriptor at `now`. Fails when `deadline_ms` falls outside
    /// the representable date range.
    pub fn into_request(self, now: DateTime<Utc>) -> Result<TaskRequest, SupervisorError> {
        let deadline = match self.deadline_ms {
            None => None,
            Some(ms) => Some(
                i64::try_from(ms)
                    .ok()
                    .and_then(TimeDelta::try_milliseconds)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| SupervisorError::InvalidTask {
                        reason: format!("deadline_ms {ms} is out of range"),
                    })?,
            ),
        };
        Ok(TaskRequest {
            id: TaskId::generate(),
            payload: TaskPayload {
                query: self.query,
                location: self.location,
                context: self.context,
            },
            required_capability: self.capability,
            submitted_at: now,
            deadline,
            retry_count: 0,
            resubmission_of: self.resubmission_of,
        })
    }
}

/// A versioned task-to-agent binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub tier: Tier,
    pub version: u64,
    pub decided_at: DateTime<Utc>,
    /// Set when an operator forced this placement.
    #[serde(default)]
    pub manual: bool,
}

/// Terminal success of a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub placement_version: u64,
    /// Number of placements it took, including the successful one.
    pub attempts: u32,
    pub output: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resubmission_gets_a_new_id_with_back_reference() {
        let original = TaskRequest::new(Capability::from("air_quality"), TaskPayload::default());
        let again = original.resubmit();

        assert_ne!(again.id, original.id);
        assert_eq!(again.resubmission_of.as_ref(), Some(&original.id));
        assert!(again.id.as_str().starts_with("task-"));
    }

    #[test]
    fn descriptor_deadline_is_relative_to_submission() {
        let now = Utc::now();
        let descriptor: TaskDescriptor = serde_json::from_str(
            r#"{"capability":"air_quality","query":"pm25","location":"office","deadline_ms":500}"#,
        )
        .unwrap();

        let request = descriptor.into_request(now).unwrap();
        assert_eq!(request.deadline, Some(now + chrono::Duration::milliseconds(500)));
        assert_eq!(request.preferred_location(), Some("office"));
        assert!(!request.is_expired(now));
        assert!(request.is_expired(now + chrono::Duration::milliseconds(500)));
    }

    #[test]
    fn unrepresentable_deadline_is_rejected() {
        let now = Utc::now();
        let descriptor = TaskDescriptor {
            capability: Capability::from("air_quality"),
            query: String::new(),
            location: None,
            context: serde_json::Value::Null,
            deadline_ms: Some(u64::MAX),
            resubmission_of: None,
        };

        let err = descriptor.clone().into_request(now).unwrap_err();
        assert_eq!(err.code(), "INVALID_TASK");

        // Fits in an i64 but not in chrono's date range.
        let far = TaskDescriptor {
            deadline_ms: Some(i64::MAX as u64),
            ..descriptor
        };
        assert!(matches!(far.into_request(now), Err(SupervisorError::InvalidTask { .. })));
    }
}
