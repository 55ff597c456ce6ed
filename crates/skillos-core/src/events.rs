//! Structured events emitted by the invoker and the run loop.

use crate::types::{Id, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunFinished,
    SkillStarted,
    SkillSucceeded,
    SkillFailed,
    SkillTimeout,
    /// The breaker refused the call; the handler was not invoked.
    CircuitRejected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunFinished => "run_finished",
            Self::SkillStarted => "skill_started",
            Self::SkillSucceeded => "skill_succeeded",
            Self::SkillFailed => "skill_failed",
            Self::SkillTimeout => "skill_timeout",
            Self::CircuitRejected => "circuit_rejected",
        }
    }
}

/// Payload for RUN_STARTED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub trace_id: Id,
    pub task: String,
    pub max_steps: u32,
}

/// Payload for RUN_FINISHED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: Id,
    pub trace_id: Id,
    pub status: RunStatus,
    pub steps_completed: u32,
    pub total_time_ms: u64,
}

/// Payload shared by every per-attempt invocation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub trace_id: Id,
    pub run_id: Id,
    pub step_id: Id,
    pub handler: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    RunFinished(RunFinishedPayload),
    Invocation(InvocationPayload),
}

impl EventPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            id: Id::new(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn run_id(&self) -> &Id {
        match &self.payload {
            EventPayload::RunStarted(p) => &p.run_id,
            EventPayload::RunFinished(p) => &p.run_id,
            EventPayload::Invocation(p) => &p.run_id,
        }
    }
}
