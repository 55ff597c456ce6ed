//! Per-handler circuit breakers.
//!
//! [`CircuitRegistry`] drives the pure transitions from
//! `skillos_core::circuit` through a [`CircuitStore`] using compare-and-set
//! loops, so concurrent callers (threads or processes) never lose updates.
//! If the shared store fails, the registry switches to an in-process store
//! for the rest of its life and logs that it is degraded.

mod sqlite;
mod store;

pub use sqlite::SqliteCircuitStore;
pub use store::{CircuitStore, InMemoryCircuitStore, StoreError};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use skillos_core::{Admission, BreakerPolicy, CircuitPhase, CircuitSnapshot, CircuitState};
use tracing::{debug, error, info, warn};

/// Upper bound on compare-and-set retries for a single operation.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Time source for breaker decisions.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::TimeDelta::from_std(by).unwrap_or(chrono::TimeDelta::MAX);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|_| Utc::now(), |now| *now)
    }
}

#[derive(Debug)]
pub struct CircuitRegistry {
    policy: BreakerPolicy,
    primary: Arc<dyn CircuitStore>,
    fallback: Arc<InMemoryCircuitStore>,
    degraded: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl CircuitRegistry {
    /// Registry backed by an in-process store.
    pub fn in_memory(policy: BreakerPolicy) -> Self {
        Self::with_store(policy, Arc::new(InMemoryCircuitStore::new()))
    }

    pub fn with_store(policy: BreakerPolicy, store: Arc<dyn CircuitStore>) -> Self {
        Self {
            policy,
            primary: store,
            fallback: Arc::new(InMemoryCircuitStore::new()),
            degraded: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use the shared SQLite store at `db_path` when given, falling back to
    /// in-process state if it cannot be opened.
    pub async fn connect(policy: BreakerPolicy, db_path: Option<&Path>) -> Self {
        let Some(path) = db_path else {
            return Self::in_memory(policy);
        };
        match SqliteCircuitStore::open(path).await {
            Ok(store) => {
                info!(path = %path.display(), "using shared circuit store");
                Self::with_store(policy, Arc::new(store))
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "shared circuit store unavailable; running degraded with in-process state"
                );
                let registry = Self::in_memory(policy);
                registry.degraded.store(true, Ordering::SeqCst);
                registry
            }
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// True once the registry has fallen back to in-process state.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn active_store(&self) -> &dyn CircuitStore {
        if self.is_degraded() {
            self.fallback.as_ref() as &dyn CircuitStore
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                backend = self.primary.backend(),
                error = %err,
                "circuit store failed; running degraded with in-process state"
            );
        }
    }

    /// Ask whether a call to `handler` may proceed.
    pub async fn try_admit(&self, handler: &str) -> Admission {
        match self.admit_on(self.active_store(), handler).await {
            Ok(admission) => admission,
            Err(e) => {
                self.degrade(&e);
                self.admit_on(self.fallback.as_ref(), handler)
                    .await
                    .unwrap_or_else(|e| {
                        error!(handler, error = %e, "circuit check failed; admitting call");
                        Admission::Allowed { trial: false }
                    })
            }
        }
    }

    /// Report a successful call. `trial` is the flag from the call's
    /// [`Admission::Allowed`].
    pub async fn record_success(&self, handler: &str, trial: bool) {
        if let Err(e) = self.success_on(self.active_store(), handler, trial).await {
            self.degrade(&e);
            if let Err(e) = self.success_on(self.fallback.as_ref(), handler, trial).await {
                error!(handler, error = %e, "failed to record success");
            }
        }
    }

    pub async fn record_failure(&self, handler: &str, trial: bool) {
        if let Err(e) = self.failure_on(self.active_store(), handler, trial).await {
            self.degrade(&e);
            if let Err(e) = self.failure_on(self.fallback.as_ref(), handler, trial).await {
                error!(handler, error = %e, "failed to record failure");
            }
        }
    }

    /// Inspection view of one breaker.
    pub async fn circuit_state(&self, handler: &str) -> CircuitSnapshot {
        let state = match self.active_store().get(handler).await {
            Ok(state) => state,
            Err(e) => {
                self.degrade(&e);
                self.fallback
                    .get(handler)
                    .await
                    .unwrap_or_else(|_| CircuitState::closed(handler))
            }
        };
        state.snapshot()
    }

    /// Every breaker the store has seen, ordered by handler.
    pub async fn list(&self) -> Vec<CircuitSnapshot> {
        let states = match self.active_store().list().await {
            Ok(states) => states,
            Err(e) => {
                self.degrade(&e);
                self.fallback.list().await.unwrap_or_default()
            }
        };
        states.iter().map(CircuitState::snapshot).collect()
    }

    async fn admit_on(&self, store: &dyn CircuitStore, handler: &str) -> Result<Admission, StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = store.get(handler).await?;
            let (admission, next) = state.admit(&self.policy, self.clock.now());
            let Some(next) = next else {
                if let Admission::Rejected { retry_after } = admission {
                    debug!(
                        handler,
                        phase = state.phase.as_str(),
                        retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                        "circuit rejected call"
                    );
                }
                return Ok(admission);
            };
            if store.compare_and_set(state.version, &next).await? {
                if state.phase == CircuitPhase::Open {
                    info!(handler, "circuit half-open; trial call admitted");
                }
                return Ok(admission);
            }
        }
        Err(StoreError::Contention(handler.to_string()))
    }

    async fn success_on(
        &self,
        store: &dyn CircuitStore,
        handler: &str,
        trial: bool,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = store.get(handler).await?;
            let Some(next) = state.on_success(&self.policy, trial) else {
                if state.phase == CircuitPhase::HalfOpen {
                    debug!(handler, "ignoring stale success while half-open");
                }
                return Ok(());
            };
            if store.compare_and_set(state.version, &next).await? {
                if state.phase == CircuitPhase::HalfOpen && next.phase == CircuitPhase::Closed {
                    info!(handler, "circuit closed after successful trials");
                }
                return Ok(());
            }
        }
        Err(StoreError::Contention(handler.to_string()))
    }

    async fn failure_on(
        &self,
        store: &dyn CircuitStore,
        handler: &str,
        trial: bool,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let state = store.get(handler).await?;

            if state.phase == CircuitPhase::Closed {
                // Concurrent failures must all be counted, so closed breakers
                // use the store's atomic increment rather than CAS.
                let Some(updated) = store.increment_failure(handler, now).await? else {
                    continue;
                };
                return self.trip_if_due(store, updated).await;
            }

            let Some(next) = state.on_failure(&self.policy, now, trial) else {
                debug!(handler, "ignoring stale failure while half-open");
                return Ok(());
            };
            if store.compare_and_set(state.version, &next).await? {
                if state.phase == CircuitPhase::HalfOpen {
                    warn!(handler, "trial call failed; circuit reopened");
                }
                return Ok(());
            }
        }
        Err(StoreError::Contention(handler.to_string()))
    }

    async fn trip_if_due(
        &self,
        store: &dyn CircuitStore,
        mut current: CircuitState,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(next) = current.trip_if_due(&self.policy) else {
                return Ok(());
            };
            if store.compare_and_set(current.version, &next).await? {
                warn!(
                    handler = %next.handler,
                    failures = next.failure_count,
                    threshold = self.policy.failure_threshold,
                    "circuit opened"
                );
                return Ok(());
            }
            current = store.get(&current.handler).await?;
        }
        Err(StoreError::Contention(current.handler))
    }
}
