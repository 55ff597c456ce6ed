//! Circuit breaker state and its pure transition functions.
//!
//! Stores only hold [`CircuitState`] values; every phase change is computed
//! here and written back with compare-and-set on `version`, so the same rules
//! apply whether state lives in-process or in a shared database.
//!
//! Phases:
//! - `CLOSED`: calls pass; consecutive failures are counted.
//! - `OPEN`: calls are rejected until `recovery_timeout` has elapsed since the
//!   last failure. The move to `HALF_OPEN` happens lazily at admission.
//! - `HALF_OPEN`: a fixed number of trial calls pass. All trials succeeding
//!   closes the breaker; any trial failure reopens it and restarts the timer.
//!   Results from calls admitted before the breaker opened are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Breaker parameters, shared by every handler in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_trials: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_trials: 1,
        }
    }
}

impl BreakerPolicy {
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(u64::from(config.breaker_recovery_timeout_sec)),
            half_open_trials: config.breaker_half_open_trials.max(1),
        }
    }
}

/// Persisted breaker state for one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub handler: String,
    pub phase: CircuitPhase,
    /// Consecutive failures while closed (kept for inspection once open).
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Trials granted since entering `HALF_OPEN`.
    pub trial_count: u32,
    /// Trials that reported success since entering `HALF_OPEN`.
    pub trial_successes: u32,
    /// Monotonic revision; bumped by every write.
    pub version: u64,
}

/// Outcome of asking a breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { trial: bool },
    Rejected { retry_after: Option<Duration> },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Read-only view returned by `circuit_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub handler: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub trial_count: u32,
}

impl CircuitState {
    /// Fresh closed breaker (what a store returns for an unknown handler).
    pub fn closed(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            phase: CircuitPhase::Closed,
            failure_count: 0,
            last_failure_at: None,
            trial_count: 0,
            trial_successes: 0,
            version: 0,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            handler: self.handler.clone(),
            phase: self.phase,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            trial_count: self.trial_count,
        }
    }

    fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    fn elapsed_since_failure(&self, now: DateTime<Utc>) -> Duration {
        self.last_failure_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    fn recovery_elapsed(&self, policy: &BreakerPolicy, now: DateTime<Utc>) -> bool {
        match self.last_failure_at {
            Some(_) => self.elapsed_since_failure(now) >= policy.recovery_timeout,
            None => true,
        }
    }

    /// Decide whether a call may proceed, returning the state to persist
    /// when the decision changes it.
    pub fn admit(
        &self,
        policy: &BreakerPolicy,
        now: DateTime<Utc>,
    ) -> (Admission, Option<CircuitState>) {
        match self.phase {
            CircuitPhase::Closed => (Admission::Allowed { trial: false }, None),
            CircuitPhase::Open => {
                if !self.recovery_elapsed(policy, now) {
                    let remaining = policy
                        .recovery_timeout
                        .saturating_sub(self.elapsed_since_failure(now));
                    return (
                        Admission::Rejected {
                            retry_after: Some(remaining),
                        },
                        None,
                    );
                }
                let mut next = self.next_revision();
                next.phase = CircuitPhase::HalfOpen;
                next.trial_count = 1;
                next.trial_successes = 0;
                (Admission::Allowed { trial: true }, Some(next))
            }
            CircuitPhase::HalfOpen => {
                if self.trial_count >= policy.half_open_trials {
                    return (Admission::Rejected { retry_after: None }, None);
                }
                let mut next = self.next_revision();
                next.trial_count += 1;
                (Admission::Allowed { trial: true }, Some(next))
            }
        }
    }

    /// Apply a success report. `trial` is the flag the call was admitted
    /// with. Late successes while `OPEN`, and non-trial successes while
    /// `HALF_OPEN`, are ignored.
    pub fn on_success(&self, policy: &BreakerPolicy, trial: bool) -> Option<CircuitState> {
        match self.phase {
            CircuitPhase::Closed => {
                if self.failure_count == 0 {
                    return None;
                }
                let mut next = self.next_revision();
                next.failure_count = 0;
                Some(next)
            }
            CircuitPhase::Open => None,
            CircuitPhase::HalfOpen if !trial => None,
            CircuitPhase::HalfOpen => {
                let mut next = self.next_revision();
                next.trial_successes += 1;
                if next.trial_successes >= policy.half_open_trials {
                    next.phase = CircuitPhase::Closed;
                    next.failure_count = 0;
                    next.trial_count = 0;
                    next.trial_successes = 0;
                }
                Some(next)
            }
        }
    }

    /// Apply a failure report. A non-trial failure while `HALF_OPEN` comes
    /// from a call admitted before the breaker opened and is ignored.
    pub fn on_failure(
        &self,
        policy: &BreakerPolicy,
        now: DateTime<Utc>,
        trial: bool,
    ) -> Option<CircuitState> {
        if self.phase == CircuitPhase::HalfOpen && !trial {
            return None;
        }
        let mut next = self.next_revision();
        next.failure_count = self.failure_count.saturating_add(1);
        next.last_failure_at = Some(now);
        match self.phase {
            CircuitPhase::Closed => {
                if next.failure_count >= policy.failure_threshold {
                    next.phase = CircuitPhase::Open;
                }
            }
            CircuitPhase::Open => {}
            CircuitPhase::HalfOpen => {
                next.phase = CircuitPhase::Open;
                next.trial_count = 0;
                next.trial_successes = 0;
            }
        }
        Some(next)
    }

    /// Move a closed breaker whose count already reached the threshold to
    /// `OPEN`. Used after an atomic increment performed by the store.
    pub fn trip_if_due(&self, policy: &BreakerPolicy) -> Option<CircuitState> {
        if self.phase != CircuitPhase::Closed || self.failure_count < policy.failure_threshold {
            return None;
        }
        let mut next = self.next_revision();
        next.phase = CircuitPhase::Open;
        Some(next)
    }
}
