//! Task routing.
//!
//! `route` turns task text plus the run's accumulated context into exactly one
//! [`RouteDecision`], or a [`RoutingError`] when nothing qualifies and no
//! default handler is configured. Routing is pure: the same registry,
//! heuristics, similarity provider and inputs always yield the same decision.

mod score;

pub use score::{
    normalize, rank, score_candidates, tokenize, trigger_matches, Candidate, ScoreWeights,
    SimilarityProvider,
};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use skillos_core::{Alternative, Config, HandlerManifest, HeuristicTable, RouteDecision, RoutingMode};
use thiserror::Error;
use tracing::debug;

use crate::registry::HandlerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("task text is empty")]
    EmptyTask,
    #[error("no eligible handler for task: {0}")]
    NoEligibleHandler(String),
    #[error("unknown handler: {0}")]
    UnknownHandler(String),
}

/// What the run has learned so far; drives exclusions and handler params.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub mode: RoutingMode,
    /// Handler chosen for the previous step.
    pub previous_handler: Option<String>,
    /// Handlers whose invocation failed earlier in this run.
    pub failed_handlers: BTreeSet<String>,
    /// Capability flags the run provides.
    pub capabilities: BTreeSet<String>,
    /// Rendered outputs of successful steps, oldest first.
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub min_confidence: f64,
    pub weights: ScoreWeights,
    pub default_handler: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            weights: ScoreWeights::default(),
            default_handler: None,
        }
    }
}

impl RouterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_confidence: config.min_confidence,
            weights: ScoreWeights {
                semantic_weight: config.semantic_weight,
                confidence_k: config.confidence_k,
            },
            default_handler: config.default_handler.clone(),
        }
    }
}

pub struct SkillRouter {
    registry: Arc<HandlerRegistry>,
    heuristics: Arc<HeuristicTable>,
    similarity: Option<Arc<dyn SimilarityProvider>>,
    config: RouterConfig,
}

impl std::fmt::Debug for SkillRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRouter")
            .field("handlers", &self.registry.len())
            .field("heuristics", &self.heuristics.entries().len())
            .field("similarity", &self.similarity.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl SkillRouter {
    pub fn new(registry: Arc<HandlerRegistry>, config: RouterConfig) -> Self {
        Self {
            registry,
            heuristics: Arc::new(HeuristicTable::default()),
            similarity: None,
            config,
        }
    }

    pub fn with_heuristics(mut self, heuristics: Arc<HeuristicTable>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn with_similarity(mut self, provider: Arc<dyn SimilarityProvider>) -> Self {
        self.similarity = Some(provider);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Look up a handler named by an upstream plan step.
    pub fn resolve(&self, name: &str) -> Result<&HandlerManifest, RoutingError> {
        self.registry
            .manifest(name)
            .ok_or_else(|| RoutingError::UnknownHandler(name.to_string()))
    }

    fn is_excluded(&self, manifest: &HandlerManifest, ctx: &RouteContext) -> bool {
        if ctx.failed_handlers.contains(&manifest.name) {
            return true;
        }
        if !manifest.requires_context.is_subset(&ctx.capabilities) {
            return true;
        }
        ctx.previous_handler
            .as_deref()
            .and_then(|prev| self.registry.manifest(prev))
            .is_some_and(|prev| prev.mutually_exclusive_with.contains(&manifest.name))
    }

    pub fn route(&self, text: &str, ctx: &RouteContext) -> Result<RouteDecision, RoutingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoutingError::EmptyTask);
        }

        let eligible = self.registry.manifests().filter(|m| !self.is_excluded(m, ctx));
        let candidates = score_candidates(
            text,
            eligible,
            ctx.mode,
            &self.heuristics,
            self.similarity.as_deref(),
            self.config.weights,
        );

        let alternatives = |skip: usize| -> Vec<Alternative> {
            candidates
                .iter()
                .skip(skip)
                .map(|c| Alternative {
                    handler: c.handler.clone(),
                    confidence: c.confidence,
                })
                .collect()
        };

        if let Some(best) = candidates
            .first()
            .filter(|c| c.confidence >= self.config.min_confidence)
        {
            debug!(
                handler = %best.handler,
                confidence = best.confidence,
                candidates = candidates.len(),
                "routed task"
            );
            return Ok(RouteDecision {
                handler: best.handler.clone(),
                params: self.params_for(&best.handler, text, ctx),
                confidence: best.confidence,
                alternatives: alternatives(1),
                rationale: best.rationale.clone(),
                fallback: false,
            });
        }

        match self
            .config
            .default_handler
            .as_deref()
            .filter(|name| !ctx.failed_handlers.contains(*name))
        {
            Some(fallback) => {
                debug!(
                    handler = fallback,
                    best_confidence = candidates.first().map(|c| c.confidence),
                    "no candidate above threshold; using default handler"
                );
                Ok(RouteDecision {
                    handler: fallback.to_string(),
                    params: self.params_for(fallback, text, ctx),
                    confidence: self.config.min_confidence / 2.0,
                    alternatives: alternatives(0),
                    rationale: vec!["fallback".to_string()],
                    fallback: true,
                })
            }
            None => Err(RoutingError::NoEligibleHandler(text.to_string())),
        }
    }

    /// Bind every required input key to the task text and attach prior
    /// observations as `context`.
    fn params_for(&self, handler: &str, text: &str, ctx: &RouteContext) -> Map<String, Value> {
        let mut params = Map::new();
        let keys = self
            .registry
            .manifest(handler)
            .map(|m| m.input_required.clone())
            .unwrap_or_else(|| vec!["text".to_string()]);
        for key in keys {
            params.insert(key, Value::String(text.to_string()));
        }
        if !ctx.observations.is_empty() {
            params.insert(
                "context".to_string(),
                Value::Array(
                    ctx.observations
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Handler, HandlerContext, HandlerError};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn execute(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
            Ok(json!({}))
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let research = HandlerManifest::new("research", "1.0.0", "Research a topic")
            .with_triggers(["research", "find", "look up"])
            .with_priority(9)
            .with_exclusions(["research"]);
        let summarize = HandlerManifest::new("summarize", "1.0.0", "Summarize text")
            .with_triggers(["summarize", "summary"])
            .with_priority(5);
        let mut recall = HandlerManifest::new("memory-search", "1.0.0", "Search memory")
            .with_triggers(["remember", "recall"])
            .with_priority(10)
            .with_required_context(["memory"]);
        recall.input_required = vec!["query".to_string()];

        Arc::new(
            HandlerRegistry::builder()
                .register(research, Arc::new(Noop))
                .unwrap()
                .register(summarize, Arc::new(Noop))
                .unwrap()
                .register(recall, Arc::new(Noop))
                .unwrap()
                .build(),
        )
    }

    fn router(default_handler: Option<&str>) -> SkillRouter {
        SkillRouter::new(
            registry(),
            RouterConfig {
                default_handler: default_handler.map(String::from),
                ..RouterConfig::default()
            },
        )
    }

    #[test]
    fn priority_breaks_keyword_tie() {
        let decision = router(None)
            .route("Summarize recent AI safety research", &RouteContext::default())
            .unwrap();
        assert_eq!(decision.handler, "research");
        assert!((decision.confidence - 0.5).abs() < 1e-9);
        assert!(!decision.fallback);
        assert_eq!(decision.alternatives.len(), 1);
        assert_eq!(decision.alternatives[0].handler, "summarize");
        assert_eq!(decision.params["text"], "Summarize recent AI safety research");
    }

    #[test]
    fn confidence_stays_in_unit_range_with_negative_k() {
        let config = RouterConfig {
            weights: ScoreWeights {
                confidence_k: -0.5,
                ..ScoreWeights::default()
            },
            ..RouterConfig::default()
        };
        let decision = SkillRouter::new(registry(), config)
            .route("Summarize recent AI safety research", &RouteContext::default())
            .unwrap();
        assert!((0.0..=1.0).contains(&decision.confidence));
        assert!(decision
            .alternatives
            .iter()
            .all(|a| (0.0..=1.0).contains(&a.confidence)));
    }

    #[test]
    fn routing_is_deterministic() {
        let router = router(Some("summarize"));
        let ctx = RouteContext::default();
        let first = router.route("find and summarize papers", &ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(router.route("find and summarize papers", &ctx).unwrap(), first);
        }
    }

    #[test]
    fn mutual_exclusion_blocks_repeat_of_previous_handler() {
        let ctx = RouteContext {
            previous_handler: Some("research".to_string()),
            observations: vec!["three papers found".to_string()],
            ..RouteContext::default()
        };
        let decision = router(None)
            .route("Summarize recent AI safety research", &ctx)
            .unwrap();
        assert_eq!(decision.handler, "summarize");
        assert_eq!(decision.params["context"], json!(["three papers found"]));
    }

    #[test]
    fn failed_handlers_are_excluded_including_fallback() {
        let ctx = RouteContext {
            failed_handlers: ["research".to_string(), "summarize".to_string()].into(),
            ..RouteContext::default()
        };
        let err = router(Some("summarize"))
            .route("Summarize recent research", &ctx)
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleHandler(_)));
    }

    #[test]
    fn required_context_gates_candidates() {
        let router = router(None);
        let err = router
            .route("recall what we discussed", &RouteContext::default())
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleHandler(_)));

        let ctx = RouteContext {
            capabilities: ["memory".to_string()].into(),
            ..RouteContext::default()
        };
        let decision = router.route("recall what we discussed", &ctx).unwrap();
        assert_eq!(decision.handler, "memory-search");
        assert_eq!(decision.params["query"], "recall what we discussed");
        assert!(decision.params.get("text").is_none());
    }

    #[test]
    fn low_confidence_falls_back_to_default_handler() {
        let router = SkillRouter::new(
            registry(),
            RouterConfig {
                min_confidence: 0.6,
                default_handler: Some("summarize".to_string()),
                ..RouterConfig::default()
            },
        );
        let decision = router
            .route("research the topic", &RouteContext::default())
            .unwrap();
        assert!(decision.fallback);
        assert_eq!(decision.handler, "summarize");
        assert!((decision.confidence - 0.3).abs() < 1e-9);
        assert_eq!(decision.alternatives[0].handler, "research");
        assert_eq!(decision.rationale, vec!["fallback".to_string()]);
    }

    #[test]
    fn no_match_without_default_is_an_error() {
        let err = router(None)
            .route("what's the weather", &RouteContext::default())
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::NoEligibleHandler("what's the weather".to_string())
        );
        assert_eq!(
            router(None).route("   ", &RouteContext::default()).unwrap_err(),
            RoutingError::EmptyTask
        );
    }

    #[test]
    fn resolve_reports_unknown_handlers() {
        let router = router(None);
        assert_eq!(router.resolve("research").unwrap().priority, 9);
        assert_eq!(
            router.resolve("translate").unwrap_err(),
            RoutingError::UnknownHandler("translate".to_string())
        );
    }
}
