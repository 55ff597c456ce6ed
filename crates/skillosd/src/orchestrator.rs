//! Orchestration loop.
//!
//! A run is a bounded sequence of route → invoke → record → terminate? cycles
//! for one task. Steps within a run are strictly sequential; independent runs
//! share the registry, router and breakers without locking.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use skillos_core::answer::{check_answer, render_observation};
use skillos_core::events::{EventPayload, EventType, RunFinishedPayload, RunStartedPayload};
use skillos_core::{
    BreakerPolicy, CircuitSnapshot, Config, ErrorKind, HandlerManifest, HeuristicTable, Id,
    InvocationOutcome, RunConfig, RunMetadata, RunResult, RunStatus, StepResult, Termination,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitRegistry;
use crate::events::EventBus;
use crate::invoker::{InvocationContext, Invoker, InvokerConfig};
use crate::memory::{MemoryRecord, MemoryStore};
use crate::registry::HandlerRegistry;
use crate::router::{RouteContext, RouterConfig, SimilarityProvider, SkillRouter};

/// Capability flag provided to routing when a memory store is attached.
pub const MEMORY_CAPABILITY: &str = "memory";

const OBSERVATION_MAX_CHARS: usize = 500;
const DEFAULT_MEMORY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task text is empty")]
    EmptyTask,
    #[error("invalid run config: {0}")]
    InvalidConfig(String),
    #[error("router chose unregistered handler: {0}")]
    UnregisteredHandler(String),
    #[error("unknown handler: {0}")]
    UnknownHandler(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub struct Orchestrator {
    registry: Arc<HandlerRegistry>,
    router: SkillRouter,
    invoker: Invoker,
    breakers: Arc<CircuitRegistry>,
    events: EventBus,
    memory: Option<Arc<dyn MemoryStore>>,
    memory_timeout: Duration,
    capabilities: BTreeSet<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("router", &self.router)
            .field("invoker", &self.invoker)
            .field("memory", &self.memory.is_some())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Orchestrator`]. Only the registry is required.
pub struct OrchestratorBuilder {
    registry: Arc<HandlerRegistry>,
    breakers: Option<Arc<CircuitRegistry>>,
    events: EventBus,
    heuristics: Arc<HeuristicTable>,
    similarity: Option<Arc<dyn SimilarityProvider>>,
    memory: Option<Arc<dyn MemoryStore>>,
    memory_timeout: Duration,
    router_config: RouterConfig,
    invoker_config: InvokerConfig,
    capabilities: BTreeSet<String>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("router_config", &self.router_config)
            .field("invoker_config", &self.invoker_config)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Apply router, invoker and memory settings from a config file.
    pub fn config(mut self, config: &Config) -> Self {
        self.router_config = RouterConfig::from_config(config);
        self.invoker_config = InvokerConfig::from_config(config);
        self.memory_timeout = Duration::from_millis(config.memory_timeout_ms);
        self
    }

    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    pub fn invoker_config(mut self, config: InvokerConfig) -> Self {
        self.invoker_config = config;
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn heuristics(mut self, heuristics: Arc<HeuristicTable>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn similarity(mut self, provider: Arc<dyn SimilarityProvider>) -> Self {
        self.similarity = Some(provider);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn memory_timeout(mut self, timeout: Duration) -> Self {
        self.memory_timeout = timeout;
        self
    }

    /// Extra capability flags offered to handlers' `requires_context`.
    pub fn capabilities<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Orchestrator {
        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(CircuitRegistry::in_memory(BreakerPolicy::default())));

        let mut router = SkillRouter::new(Arc::clone(&self.registry), self.router_config)
            .with_heuristics(self.heuristics);
        if let Some(provider) = self.similarity {
            router = router.with_similarity(provider);
        }

        let invoker = Invoker::new(
            Arc::clone(&self.registry),
            Arc::clone(&breakers),
            self.events.clone(),
            self.invoker_config,
        );

        let mut capabilities = self.capabilities;
        if self.memory.is_some() {
            capabilities.insert(MEMORY_CAPABILITY.to_string());
        }

        Orchestrator {
            registry: self.registry,
            router,
            invoker,
            breakers,
            events: self.events,
            memory: self.memory,
            memory_timeout: self.memory_timeout,
            capabilities,
        }
    }
}

fn run_status(termination: Termination, any_success: bool) -> RunStatus {
    match termination {
        Termination::Answered | Termination::MemoryHit => RunStatus::Success,
        Termination::MaxSteps if any_success => RunStatus::Partial,
        Termination::MaxSteps => RunStatus::TimeoutExhausted,
        Termination::RoutingFailed | Termination::Cancelled if any_success => RunStatus::Partial,
        Termination::RoutingFailed | Termination::Cancelled => RunStatus::Failed,
    }
}

/// Why the loop stopped and what it produced.
struct Finish {
    termination: Termination,
    answer: Option<String>,
}

impl Orchestrator {
    pub fn builder(registry: Arc<HandlerRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            breakers: None,
            events: EventBus::default(),
            heuristics: Arc::new(HeuristicTable::default()),
            similarity: None,
            memory: None,
            memory_timeout: DEFAULT_MEMORY_TIMEOUT,
            router_config: RouterConfig::default(),
            invoker_config: InvokerConfig::default(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    pub fn handlers(&self) -> Vec<HandlerManifest> {
        self.registry.manifests().cloned().collect()
    }

    /// Breaker view for one registered handler.
    pub async fn circuit_state(&self, handler: &str) -> Result<CircuitSnapshot> {
        if !self.registry.contains(handler) {
            return Err(OrchestratorError::UnknownHandler(handler.to_string()));
        }
        Ok(self.breakers.circuit_state(handler).await)
    }

    /// Breaker views for every registered handler, ordered by name.
    pub async fn circuits(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots = Vec::with_capacity(self.registry.len());
        for name in self.registry.names() {
            snapshots.push(self.breakers.circuit_state(name).await);
        }
        snapshots
    }

    /// Execute one task.
    ///
    /// Cancellation is checked before each step; a step already in flight
    /// runs to completion.
    pub async fn run(
        &self,
        task: &str,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        let task = task.trim();
        if task.is_empty() {
            return Err(OrchestratorError::EmptyTask);
        }
        if config.max_steps == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_steps must be at least 1".to_string(),
            ));
        }
        let step_timeout = Duration::try_from_secs_f64(config.timeout_seconds)
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| {
                OrchestratorError::InvalidConfig(format!(
                    "timeout_seconds must be positive, got {}",
                    config.timeout_seconds
                ))
            })?;

        let run_id = Id::new();
        let trace_id = Id::new();
        let started = Instant::now();

        info!(
            run_id = %run_id,
            trace_id = %trace_id,
            max_steps = config.max_steps,
            routing_mode = config.routing_mode.as_str(),
            "starting run"
        );
        self.events.emit(
            EventType::RunStarted,
            EventPayload::RunStarted(RunStartedPayload {
                run_id: run_id.clone(),
                trace_id: trace_id.clone(),
                task: task.to_string(),
                max_steps: config.max_steps,
            }),
        );

        let mut route_ctx = RouteContext {
            mode: config.routing_mode,
            capabilities: self.capabilities.clone(),
            ..RouteContext::default()
        };
        let mut steps: Vec<StepResult> = Vec::new();

        let finish = loop {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, steps = steps.len(), "run cancelled");
                break Finish {
                    termination: Termination::Cancelled,
                    answer: None,
                };
            }

            let index = steps.len() as u32 + 1;
            let step_id = Id::new();
            let step_started_at = Utc::now();

            let decision = match self.router.route(task, &route_ctx) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(run_id = %run_id, step = index, error = %e, "routing failed");
                    steps.push(StepResult {
                        step_id,
                        index,
                        handler: None,
                        confidence: None,
                        input: json!({ "text": task }),
                        outcome: InvocationOutcome::failed(ErrorKind::Routing, e.to_string(), 0, 0),
                        started_at: step_started_at,
                    });
                    break Finish {
                        termination: Termination::RoutingFailed,
                        answer: None,
                    };
                }
            };

            if !self.registry.contains(&decision.handler) {
                return Err(OrchestratorError::UnregisteredHandler(decision.handler));
            }

            debug!(
                run_id = %run_id,
                step = index,
                handler = %decision.handler,
                confidence = decision.confidence,
                fallback = decision.fallback,
                rationale = ?decision.rationale,
                "step routed"
            );

            let input = Value::Object(decision.params);
            let invocation_ctx = InvocationContext {
                trace_id: trace_id.clone(),
                run_id: run_id.clone(),
                step_id: step_id.clone(),
                timeout: Some(step_timeout),
                memory: self.memory.clone(),
            };
            let outcome = self
                .invoker
                .invoke(&decision.handler, input.clone(), &invocation_ctx)
                .await;

            let answer = match outcome.payload.as_ref().map(check_answer) {
                Some(check) if check.is_definitive() => {
                    debug!(
                        run_id = %run_id,
                        step = index,
                        field = check.field,
                        "definitive answer"
                    );
                    check.answer
                }
                Some(check) => {
                    if check.is_malformed {
                        warn!(
                            run_id = %run_id,
                            step = index,
                            handler = %decision.handler,
                            "answer field present but empty or not a string"
                        );
                    }
                    None
                }
                None => None,
            };
            let observation = match (&outcome.payload, &outcome.error) {
                (Some(payload), _) => render_observation(payload, OBSERVATION_MAX_CHARS),
                (None, Some(err)) => err.message.clone(),
                (None, None) => String::new(),
            };

            self.remember(MemoryRecord {
                run_id: run_id.clone(),
                step_id: step_id.clone(),
                task: task.to_string(),
                handler: decision.handler.clone(),
                success: outcome.success,
                observation: observation.clone(),
                answer: answer.clone(),
                created_at: Utc::now(),
            })
            .await;

            if outcome.success {
                route_ctx.observations.push(observation);
            } else {
                route_ctx.failed_handlers.insert(decision.handler.clone());
            }
            route_ctx.previous_handler = Some(decision.handler.clone());

            steps.push(StepResult {
                step_id,
                index,
                handler: Some(decision.handler),
                confidence: Some(decision.confidence),
                input,
                outcome,
                started_at: step_started_at,
            });

            if let Some(answer) = answer {
                break Finish {
                    termination: Termination::Answered,
                    answer: Some(answer),
                };
            }

            if let Some(remembered) = self.recall(task).await {
                info!(run_id = %run_id, step = index, "answer recalled from memory");
                break Finish {
                    termination: Termination::MemoryHit,
                    answer: Some(remembered),
                };
            }

            if index >= config.max_steps {
                break Finish {
                    termination: Termination::MaxSteps,
                    answer: None,
                };
            }
        };

        let final_answer = finish.answer.or_else(|| {
            steps
                .iter()
                .rev()
                .find_map(|s| s.outcome.payload.as_ref())
                .map(|payload| render_observation(payload, OBSERVATION_MAX_CHARS))
        });

        let total_time_ms = started.elapsed().as_millis() as u64;
        let steps_completed = steps.len() as u32;

        let mut result = RunResult {
            run_id: run_id.clone(),
            status: RunStatus::Failed,
            final_answer,
            steps,
            total_time_ms,
            steps_completed,
            metadata: RunMetadata {
                trace_id: trace_id.clone(),
                routing_mode: config.routing_mode,
                termination: finish.termination,
            },
        };
        result.status = run_status(finish.termination, result.any_step_succeeded());
        let status = result.status;

        info!(
            run_id = %run_id,
            status = status.as_str(),
            termination = finish.termination.as_str(),
            steps = steps_completed,
            total_time_ms,
            "run finished"
        );
        self.events.emit(
            EventType::RunFinished,
            EventPayload::RunFinished(RunFinishedPayload {
                run_id,
                trace_id,
                status,
                steps_completed,
                total_time_ms,
            }),
        );

        Ok(result)
    }

    /// Best-effort memory write.
    async fn remember(&self, record: MemoryRecord) {
        let Some(memory) = &self.memory else {
            return;
        };
        let step_id = record.step_id.clone();
        match tokio::time::timeout(self.memory_timeout, memory.write(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(step_id = %step_id, error = %e, "memory write failed"),
            Err(_) => warn!(
                step_id = %step_id,
                timeout_ms = self.memory_timeout.as_millis() as u64,
                "memory write timed out"
            ),
        }
    }

    /// Best-effort lookup of a prior answer for the same task.
    async fn recall(&self, task: &str) -> Option<String> {
        let memory = self.memory.as_ref()?;
        match tokio::time::timeout(self.memory_timeout, memory.lookup(task)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(error = %e, "memory lookup failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.memory_timeout.as_millis() as u64,
                    "memory lookup timed out"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::registry::{Handler, HandlerContext, HandlerError};
    use async_trait::async_trait;
    use skillos_core::BreakerAccounting;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed(Value);

    #[async_trait]
    impl Handler for Fixed {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> std::result::Result<Value, HandlerError> {
            Ok(self.0.clone())
        }
    }

    struct Failing(AtomicU32);

    #[async_trait]
    impl Handler for Failing {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> std::result::Result<Value, HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Failed("backend down".to_string()))
        }
    }

    fn quick_invoker() -> InvokerConfig {
        InvokerConfig {
            timeout: Duration::from_secs(1),
            retries: 0,
            retry_backoff: Duration::from_millis(1),
            accounting: BreakerAccounting::PerStep,
        }
    }

    fn manifest(name: &str, triggers: &[&str], priority: i32) -> HandlerManifest {
        HandlerManifest::new(name, "1.0.0", "test handler")
            .with_triggers(triggers.iter().copied())
            .with_priority(priority)
    }

    fn run_config(max_steps: u32) -> RunConfig {
        RunConfig {
            max_steps,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_handler_is_excluded_on_next_step() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(
                    manifest("research", &["research"], 9),
                    Arc::new(Failing(AtomicU32::new(0))),
                )
                .unwrap()
                .register(
                    manifest("summarize", &["summarize"], 5),
                    Arc::new(Fixed(json!({ "summary": "short version" }))),
                )
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry)
            .invoker_config(quick_invoker())
            .build();

        let result = orchestrator
            .run("summarize the research", run_config(3), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].handler.as_deref(), Some("research"));
        assert!(!result.steps[0].outcome.success);
        assert_eq!(result.steps[1].handler.as_deref(), Some("summarize"));
        assert_eq!(result.final_answer.as_deref(), Some("short version"));
    }

    #[tokio::test]
    async fn empty_answer_field_does_not_end_run() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(
                    manifest("lookup", &["lookup"], 1),
                    Arc::new(Fixed(json!({ "answer": "  " }))),
                )
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry)
            .invoker_config(quick_invoker())
            .build();

        let result = orchestrator
            .run("lookup things", run_config(1), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.metadata.termination, Termination::MaxSteps);
        assert_eq!(result.status, RunStatus::Partial);
    }

    #[test]
    fn status_follows_termination_and_progress() {
        assert_eq!(run_status(Termination::Answered, false), RunStatus::Success);
        assert_eq!(run_status(Termination::MemoryHit, true), RunStatus::Success);
        assert_eq!(run_status(Termination::MaxSteps, true), RunStatus::Partial);
        assert_eq!(
            run_status(Termination::MaxSteps, false),
            RunStatus::TimeoutExhausted
        );
        assert_eq!(run_status(Termination::RoutingFailed, true), RunStatus::Partial);
        assert_eq!(run_status(Termination::Cancelled, false), RunStatus::Failed);
    }

    #[tokio::test]
    async fn exhausting_steps_without_answer_is_partial() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(
                    manifest("lookup", &["lookup"], 1),
                    Arc::new(Fixed(json!({ "matches": ["a", "b"] }))),
                )
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry)
            .invoker_config(quick_invoker())
            .build();

        let result = orchestrator
            .run("lookup things", run_config(3), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.steps_completed, 3);
        assert_eq!(result.metadata.termination, Termination::MaxSteps);
        assert!(result.final_answer.unwrap().contains("matches"));
    }

    #[tokio::test]
    async fn memory_hit_ends_run_early() {
        let memory = Arc::new(InMemoryStore::new());
        memory
            .write(MemoryRecord {
                run_id: Id::new(),
                step_id: Id::new(),
                task: "lookup things".to_string(),
                handler: "lookup".to_string(),
                success: true,
                observation: "earlier".to_string(),
                answer: Some("remembered answer".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(
                    manifest("lookup", &["lookup"], 1),
                    Arc::new(Fixed(json!({ "matches": [] }))),
                )
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry)
            .invoker_config(quick_invoker())
            .memory(Arc::clone(&memory) as Arc<dyn MemoryStore>)
            .build();

        let result = orchestrator
            .run("Lookup  things", run_config(5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.metadata.termination, Termination::MemoryHit);
        assert_eq!(result.final_answer.as_deref(), Some("remembered answer"));
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn unregistered_default_handler_is_fatal() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(manifest("lookup", &["lookup"], 1), Arc::new(Fixed(json!({}))))
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry)
            .router_config(RouterConfig {
                default_handler: Some("ghost".to_string()),
                ..RouterConfig::default()
            })
            .build();

        let err = orchestrator
            .run("something else", run_config(2), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnregisteredHandler(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_step() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(manifest("lookup", &["lookup"], 1), Arc::new(Fixed(json!({}))))
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry).build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .run("lookup things", run_config(3), cancel)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.metadata.termination, Termination::Cancelled);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn invalid_run_config_is_rejected() {
        let registry = Arc::new(HandlerRegistry::builder().build());
        let orchestrator = Orchestrator::builder(registry).build();

        let err = orchestrator
            .run("task", run_config(0), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

        let config = RunConfig {
            timeout_seconds: 0.0,
            ..RunConfig::default()
        };
        let err = orchestrator
            .run("task", config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

        let err = orchestrator
            .run("  ", RunConfig::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyTask));
    }

    #[tokio::test]
    async fn circuit_state_rejects_unknown_handlers() {
        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(manifest("lookup", &["lookup"], 1), Arc::new(Fixed(json!({}))))
                .unwrap()
                .build(),
        );
        let orchestrator = Orchestrator::builder(registry).build();
        let snapshot = orchestrator.circuit_state("lookup").await.unwrap();
        assert_eq!(snapshot.failure_count, 0);
        assert!(matches!(
            orchestrator.circuit_state("ghost").await,
            Err(OrchestratorError::UnknownHandler(_))
        ));
        assert_eq!(orchestrator.circuits().await.len(), 1);
    }
}
