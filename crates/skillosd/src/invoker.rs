//! Resilient handler invocation.
//!
//! Every handler call goes through the same pipeline:
//! - Input validation against the manifest's required keys
//! - Circuit check (fail fast while the breaker is open)
//! - Bounded-time execution on a separate task
//! - Retry with linear backoff for handler errors and timeouts
//! - One structured event per attempt transition
//!
//! `invoke` never returns an error: every failure becomes an
//! [`InvocationOutcome`] with an [`ErrorKind`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use skillos_core::events::{EventPayload, EventType, InvocationPayload};
use skillos_core::{Admission, BreakerAccounting, Config, ErrorKind, HandlerManifest, Id, InvocationOutcome};
use tracing::{debug, info, warn};

use crate::breaker::CircuitRegistry;
use crate::events::EventBus;
use crate::memory::MemoryStore;
use crate::registry::{HandlerContext, HandlerError, HandlerRegistry, RegisteredHandler};

/// Retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokerConfig {
    /// Upper bound for one attempt.
    pub timeout: Duration,
    /// Additional attempts after the first.
    pub retries: u32,
    /// Attempt `n` waits `n * retry_backoff` before the next attempt.
    pub retry_backoff: Duration,
    pub accounting: BreakerAccounting,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
            retry_backoff: Duration::from_millis(500),
            accounting: BreakerAccounting::PerStep,
        }
    }
}

impl InvokerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(u64::from(config.step_timeout_sec)),
            retries: config.retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            accounting: config.breaker_accounting,
        }
    }
}

/// Identifiers and collaborators for one invocation.
#[derive(Clone)]
pub struct InvocationContext {
    pub trace_id: Id,
    pub run_id: Id,
    pub step_id: Id,
    /// Overrides [`InvokerConfig::timeout`] for this call.
    pub timeout: Option<Duration>,
    pub memory: Option<Arc<dyn MemoryStore>>,
}

impl InvocationContext {
    pub fn new(trace_id: Id, run_id: Id, step_id: Id) -> Self {
        Self {
            trace_id,
            run_id,
            step_id,
            timeout: None,
            memory: None,
        }
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("trace_id", &self.trace_id)
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Failure of a single attempt.
#[derive(Debug, Clone, PartialEq)]
struct AttemptError {
    kind: ErrorKind,
    message: String,
}

impl AttemptError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct Invoker {
    registry: Arc<HandlerRegistry>,
    breakers: Arc<CircuitRegistry>,
    events: EventBus,
    config: InvokerConfig,
}

/// Check that the payload is an object holding every required key.
pub fn validate_input(manifest: &HandlerManifest, payload: &Value) -> Result<(), String> {
    let Some(object) = payload.as_object() else {
        return Err(format!("{} expects a JSON object payload", manifest.name));
    };
    let missing: Vec<&str> = manifest
        .input_required
        .iter()
        .filter(|key| object.get(key.as_str()).is_none_or(Value::is_null))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "{} is missing required input: {}",
            manifest.name,
            missing.join(", ")
        ))
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

impl Invoker {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        breakers: Arc<CircuitRegistry>,
        events: EventBus,
        config: InvokerConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            events,
            config,
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    fn emit(
        &self,
        event_type: EventType,
        handler: &str,
        ctx: &InvocationContext,
        attempt: u32,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) {
        self.events.emit(
            event_type,
            EventPayload::Invocation(InvocationPayload {
                trace_id: ctx.trace_id.clone(),
                run_id: ctx.run_id.clone(),
                step_id: ctx.step_id.clone(),
                handler: handler.to_string(),
                attempt,
                latency_ms,
                error,
            }),
        );
    }

    /// Ask the breaker for permission. `Ok` carries the trial flag to report
    /// back with the result; `Err` carries the rejection outcome.
    async fn admit(
        &self,
        handler: &str,
        ctx: &InvocationContext,
        attempts: u32,
        started: Instant,
    ) -> Result<bool, InvocationOutcome> {
        match self.breakers.try_admit(handler).await {
            Admission::Allowed { trial } => Ok(trial),
            Admission::Rejected { retry_after } => {
                let message = match retry_after {
                    Some(wait) => format!(
                        "circuit open for {handler}; retry after {}ms",
                        wait.as_millis()
                    ),
                    None => format!("circuit half-open for {handler}; trial budget exhausted"),
                };
                self.emit(
                    EventType::CircuitRejected,
                    handler,
                    ctx,
                    attempts + 1,
                    None,
                    Some(message.clone()),
                );
                Err(InvocationOutcome::failed(
                    ErrorKind::CircuitOpen,
                    message,
                    elapsed_ms(started),
                    attempts,
                ))
            }
        }
    }

    /// Invoke `handler` with `payload`. Produces exactly one outcome.
    pub async fn invoke(
        &self,
        handler: &str,
        payload: Value,
        ctx: &InvocationContext,
    ) -> InvocationOutcome {
        let started = Instant::now();

        let Some(registered) = self.registry.get(handler) else {
            return InvocationOutcome::failed(
                ErrorKind::Validation,
                format!("handler not registered: {handler}"),
                0,
                0,
            );
        };

        // Validation runs before the circuit check so a bad payload never
        // consumes a half-open trial.
        if let Err(message) = validate_input(&registered.manifest, &payload) {
            warn!(
                handler,
                step_id = %ctx.step_id,
                error = %message,
                "rejecting invalid input"
            );
            self.emit(EventType::SkillFailed, handler, ctx, 0, Some(0), Some(message.clone()));
            return InvocationOutcome::failed(ErrorKind::Validation, message, elapsed_ms(started), 0);
        }

        let per_attempt = self.config.accounting == BreakerAccounting::PerAttempt;
        let mut trial = false;
        if !per_attempt {
            match self.admit(handler, ctx, 0, started).await {
                Ok(admitted) => trial = admitted,
                Err(rejected) => return rejected,
            }
        }

        let timeout = ctx.timeout.unwrap_or(self.config.timeout);
        let max_attempts = self.config.retries + 1;
        let mut last_error = AttemptError::new(ErrorKind::Handler, "no attempts made");

        for attempt in 1..=max_attempts {
            if per_attempt {
                match self.admit(handler, ctx, attempt - 1, started).await {
                    Ok(admitted) => trial = admitted,
                    Err(rejected) => return rejected,
                }
            }

            info!(
                handler,
                step_id = %ctx.step_id,
                attempt,
                max_attempts,
                timeout_ms = timeout.as_millis() as u64,
                "invoking handler"
            );
            self.emit(EventType::SkillStarted, handler, ctx, attempt, None, None);

            let attempt_started = Instant::now();
            let result = self
                .run_attempt(registered, payload.clone(), ctx, attempt, timeout)
                .await;
            let attempt_ms = elapsed_ms(attempt_started);

            let err = match result {
                Ok(value) if value.is_object() => {
                    self.breakers.record_success(handler, trial).await;
                    self.emit(EventType::SkillSucceeded, handler, ctx, attempt, Some(attempt_ms), None);
                    return InvocationOutcome::succeeded(value, elapsed_ms(started), attempt);
                }
                Ok(value) => {
                    let kind = match value {
                        Value::Null => "null",
                        Value::Bool(_) => "boolean",
                        Value::Number(_) => "number",
                        Value::String(_) => "string",
                        Value::Array(_) => "array",
                        Value::Object(_) => "object",
                    };
                    // Misbehaving output counts against the breaker but is
                    // not worth retrying.
                    self.breakers.record_failure(handler, trial).await;
                    let message = format!("{handler} returned a {kind}, expected a JSON object");
                    self.emit(
                        EventType::SkillFailed,
                        handler,
                        ctx,
                        attempt,
                        Some(attempt_ms),
                        Some(message.clone()),
                    );
                    return InvocationOutcome::failed(
                        ErrorKind::Validation,
                        message,
                        elapsed_ms(started),
                        attempt,
                    );
                }
                Err(err) => err,
            };

            let event_type = if err.kind == ErrorKind::Timeout {
                EventType::SkillTimeout
            } else {
                EventType::SkillFailed
            };
            self.emit(
                event_type,
                handler,
                ctx,
                attempt,
                Some(attempt_ms),
                Some(err.message.clone()),
            );

            if per_attempt && err.kind.is_retryable() {
                self.breakers.record_failure(handler, trial).await;
            }

            if !err.kind.is_retryable() {
                // The handler responded and refused the input; it is healthy.
                self.breakers.record_success(handler, trial).await;
                return InvocationOutcome::failed(err.kind, err.message, elapsed_ms(started), attempt);
            }

            last_error = err;

            if attempt < max_attempts {
                let backoff = self.config.retry_backoff * attempt;
                debug!(
                    handler,
                    step_id = %ctx.step_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        if !per_attempt {
            self.breakers.record_failure(handler, trial).await;
        }

        warn!(
            handler,
            step_id = %ctx.step_id,
            attempts = max_attempts,
            error = %last_error.message,
            "invocation failed after all attempts"
        );
        InvocationOutcome::failed(
            last_error.kind,
            last_error.message,
            elapsed_ms(started),
            max_attempts,
        )
    }

    /// Run one attempt on its own task under `timeout`.
    ///
    /// On timeout the task is aborted. Abort is cooperative: a handler
    /// blocked outside an await point keeps running until it yields, but its
    /// result is discarded.
    async fn run_attempt(
        &self,
        registered: &RegisteredHandler,
        payload: Value,
        ctx: &InvocationContext,
        attempt: u32,
        timeout: Duration,
    ) -> Result<Value, AttemptError> {
        let handler = Arc::clone(&registered.handler);
        let handler_ctx = HandlerContext {
            trace_id: ctx.trace_id.clone(),
            run_id: ctx.run_id.clone(),
            step_id: ctx.step_id.clone(),
            attempt,
            memory: ctx.memory.clone(),
        };
        let mut task =
            tokio::spawn(async move { handler.execute(payload, &handler_ctx).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(HandlerError::InvalidInput(message)))) => {
                Err(AttemptError::new(ErrorKind::Validation, message))
            }
            Ok(Ok(Err(HandlerError::Failed(message)))) => {
                Err(AttemptError::new(ErrorKind::Handler, message))
            }
            Ok(Err(join_err)) => Err(AttemptError::new(
                ErrorKind::Handler,
                format!("handler task failed: {join_err}"),
            )),
            Err(_) => {
                task.abort();
                Err(AttemptError::new(
                    ErrorKind::Timeout,
                    format!(
                        "{} timed out after {}ms",
                        registered.manifest.name,
                        timeout.as_millis()
                    ),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{Clock, ManualClock};
    use crate::registry::Handler;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use skillos_core::{BreakerPolicy, CircuitPhase};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Handler for Flaky {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(HandlerError::Failed(format!("failure {n}")))
            } else {
                Ok(json!({ "answer": "ok", "calls": n }))
            }
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl Handler for Slow {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(json!({ "answer": "late" }))
        }
    }

    struct Scalar;

    #[async_trait]
    impl Handler for Scalar {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
            Ok(json!("just a string"))
        }
    }

    struct Picky;

    #[async_trait]
    impl Handler for Picky {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
            Err(HandlerError::InvalidInput("text too short".to_string()))
        }
    }

    struct Harness {
        invoker: Invoker,
        breakers: Arc<CircuitRegistry>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn harness(
        handler: Arc<dyn Handler>,
        config: InvokerConfig,
        policy: BreakerPolicy,
    ) -> Harness {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(
                    HandlerManifest::new("search", "1.0.0", "Search the web").with_triggers(["search"]),
                    handler,
                )
                .unwrap()
                .build(),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breakers = Arc::new(
            CircuitRegistry::in_memory(policy).with_clock(Arc::clone(&clock) as Arc<dyn Clock>),
        );
        let events = EventBus::new(64);
        let invoker = Invoker::new(registry, Arc::clone(&breakers), events.clone(), config);
        Harness {
            invoker,
            breakers,
            clock,
            events,
        }
    }

    fn fast_config(retries: u32) -> InvokerConfig {
        InvokerConfig {
            timeout: Duration::from_millis(200),
            retries,
            retry_backoff: Duration::from_millis(1),
            accounting: BreakerAccounting::PerStep,
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new(Id::new(), Id::new(), Id::new())
    }

    fn payload() -> Value {
        json!({ "text": "latest rust release" })
    }

    #[tokio::test]
    async fn retries_until_success() {
        let h = harness(
            Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 2 }),
            fast_config(2),
            BreakerPolicy::default(),
        );
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.payload.unwrap()["calls"], 3);
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_count_once_against_breaker() {
        let h = harness(
            Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 10 }),
            fast_config(2),
            BreakerPolicy::default(),
        );
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Handler));
        assert_eq!(outcome.error.unwrap().message, "failure 3");
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 1);
    }

    #[tokio::test]
    async fn per_attempt_accounting_records_every_failure() {
        let mut config = fast_config(2);
        config.accounting = BreakerAccounting::PerAttempt;
        let h = harness(
            Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 10 }),
            config,
            BreakerPolicy::default(),
        );
        h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 3);
    }

    #[tokio::test]
    async fn per_attempt_accounting_stops_when_breaker_opens() {
        let mut config = fast_config(4);
        config.accounting = BreakerAccounting::PerAttempt;
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 10 });
        let h = harness(
            Arc::clone(&flaky) as Arc<dyn Handler>,
            config,
            BreakerPolicy {
                failure_threshold: 2,
                ..BreakerPolicy::default()
            },
        );
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::CircuitOpen));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_handler() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 100 });
        let h = harness(
            Arc::clone(&flaky) as Arc<dyn Handler>,
            fast_config(0),
            BreakerPolicy {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                half_open_trials: 1,
            },
        );
        for _ in 0..3 {
            let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
            assert_eq!(outcome.error_kind(), Some(ErrorKind::Handler));
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let mut rx = h.events.subscribe();
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::CircuitOpen));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::CircuitRejected);

        h.clock.advance(Duration::from_secs(31));
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Handler));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            h.breakers.circuit_state("search").await.phase,
            CircuitPhase::Open
        );
    }

    #[tokio::test]
    async fn successful_trial_invocation_closes_breaker() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 2 });
        let h = harness(
            Arc::clone(&flaky) as Arc<dyn Handler>,
            fast_config(0),
            BreakerPolicy {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(30),
                half_open_trials: 1,
            },
        );
        for _ in 0..2 {
            h.invoker.invoke("search", payload(), &ctx()).await;
        }
        assert_eq!(h.breakers.circuit_state("search").await.phase, CircuitPhase::Open);

        h.clock.advance(Duration::from_secs(31));
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert!(outcome.success);
        let snapshot = h.breakers.circuit_state("search").await;
        assert_eq!(snapshot.phase, CircuitPhase::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn timeout_marks_outcome_and_retries() {
        let h = harness(
            Arc::new(Slow(Duration::from_secs(5))),
            InvokerConfig {
                timeout: Duration::from_millis(20),
                retries: 1,
                retry_backoff: Duration::from_millis(1),
                accounting: BreakerAccounting::PerStep,
            },
            BreakerPolicy::default(),
        );
        let mut rx = h.events.subscribe();
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type);
        }
        assert_eq!(
            kinds,
            vec![
                EventType::SkillStarted,
                EventType::SkillTimeout,
                EventType::SkillStarted,
                EventType::SkillTimeout,
            ]
        );
    }

    #[tokio::test]
    async fn context_timeout_overrides_default() {
        let h = harness(
            Arc::new(Slow(Duration::from_millis(50))),
            fast_config(0),
            BreakerPolicy::default(),
        );
        let mut call = ctx();
        call.timeout = Some(Duration::from_millis(5));
        let outcome = h.invoker.invoke("search", payload(), &call).await;
        assert!(outcome.timed_out);

        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_circuit_check() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 0 });
        let h = harness(
            Arc::clone(&flaky) as Arc<dyn Handler>,
            fast_config(2),
            BreakerPolicy::default(),
        );
        let outcome = h.invoker.invoke("search", json!({ "query": "x" }), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 0);

        let outcome = h.invoker.invoke("search", json!(["text"]), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn non_object_output_is_a_validation_failure_without_retry() {
        let h = harness(Arc::new(Scalar), fast_config(3), BreakerPolicy::default());
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 1);
    }

    #[tokio::test]
    async fn handler_rejecting_input_is_not_retried_or_counted() {
        let h = harness(Arc::new(Picky), fast_config(3), BreakerPolicy::default());
        let outcome = h.invoker.invoke("search", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.breakers.circuit_state("search").await.failure_count, 0);
    }

    #[tokio::test]
    async fn unknown_handler_fails_validation() {
        let h = harness(Arc::new(Scalar), fast_config(0), BreakerPolicy::default());
        let outcome = h.invoker.invoke("translate", payload(), &ctx()).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    }

    #[test]
    fn validate_input_reports_missing_keys() {
        let mut manifest = HandlerManifest::new("search", "1.0.0", "Search");
        manifest.input_required = vec!["text".to_string(), "limit".to_string()];
        let err = validate_input(&manifest, &json!({ "text": "x", "limit": null })).unwrap_err();
        assert!(err.contains("limit"));
        assert!(validate_input(&manifest, &json!({ "text": "x", "limit": 3 })).is_ok());
    }
}
