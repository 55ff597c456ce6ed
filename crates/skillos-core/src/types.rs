//! Core types shared by the router, circuit breaker, invoker and run loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for runs, steps, traces and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A definitive answer was produced (or recalled from memory).
    Success,
    /// At least one step succeeded but the run ended without an answer.
    Partial,
    /// No step succeeded and the run ended on an error.
    Failed,
    /// The step budget ran out without any successful step.
    TimeoutExhausted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::TimeoutExhausted => "timeout_exhausted",
        }
    }
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Answered,
    MemoryHit,
    MaxSteps,
    RoutingFailed,
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::MemoryHit => "memory_hit",
            Self::MaxSteps => "max_steps",
            Self::RoutingFailed => "routing_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Which signals the scorer uses to build the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Trigger matches and learned boosts only.
    Keyword,
    /// Trigger matches refined by similarity scores when a provider is present.
    #[default]
    Hybrid,
    /// Every handler is a candidate; similarity scores dominate.
    Semantic,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
            Self::Semantic => "semantic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyword" => Some(Self::Keyword),
            "hybrid" => Some(Self::Hybrid),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

/// How retries are charged against a handler's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerAccounting {
    /// One failure per exhausted invocation, one circuit check per invocation.
    #[default]
    PerStep,
    /// Every failed attempt is recorded and every attempt is admitted separately.
    PerAttempt,
}

impl BreakerAccounting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerStep => "per_step",
            Self::PerAttempt => "per_attempt",
        }
    }
}

/// Failure taxonomy carried by every failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Routing,
    CircuitOpen,
    Handler,
    Timeout,
    Validation,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::CircuitOpen => "circuit_open",
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handler | Self::Timeout)
    }
}

// --- Entities ---

/// Error half of an [`InvocationOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one resilient handler invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
    pub latency_ms: u64,
    pub attempts: u32,
    pub timed_out: bool,
}

impl InvocationOutcome {
    pub fn succeeded(payload: Value, latency_ms: u64, attempts: u32) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            latency_ms,
            attempts,
            timed_out: false,
        }
    }

    pub fn failed(
        kind: ErrorKind,
        message: impl Into<String>,
        latency_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(InvocationError {
                kind,
                message: message.into(),
            }),
            latency_ms,
            attempts,
            timed_out: kind == ErrorKind::Timeout,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// The router's choice for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub handler: String,
    /// Input payload bound for the handler.
    pub params: Map<String, Value>,
    /// Normalized score in `[0, 1]`.
    pub confidence: f64,
    /// Runners-up, best first.
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    /// Signals that contributed, e.g. `keyword:research` or `heuristic:h1`.
    #[serde(default)]
    pub rationale: Vec<String>,
    /// True when the default handler was chosen because nothing qualified.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub handler: String,
    pub confidence: f64,
}

/// One (route, invoke) cycle of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: Id,
    /// 1-based position in the run.
    pub index: u32,
    /// Absent when routing failed before a handler was chosen.
    pub handler: Option<String>,
    pub confidence: Option<f64>,
    pub input: Value,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub trace_id: Id,
    pub routing_mode: RoutingMode,
    pub termination: Termination,
}

/// Final record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Id,
    pub status: RunStatus,
    pub final_answer: Option<String>,
    pub steps: Vec<StepResult>,
    pub total_time_ms: u64,
    pub steps_completed: u32,
    pub metadata: RunMetadata,
}

impl RunResult {
    pub fn any_step_succeeded(&self) -> bool {
        self.steps.iter().any(|s| s.outcome.success)
    }
}

/// Per-run limits supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_steps: u32,
    /// Upper bound for a single handler attempt.
    pub timeout_seconds: f64,
    pub routing_mode: RoutingMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            timeout_seconds: 30.0,
            routing_mode: RoutingMode::Hybrid,
        }
    }
}

impl RunConfig {
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            max_steps: config.max_steps,
            timeout_seconds: f64::from(config.step_timeout_sec),
            routing_mode: config.routing_mode,
        }
    }
}
