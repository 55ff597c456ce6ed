//! Candidate scoring.
//!
//! Pure functions over manifests, task tokens, similarity scores and the
//! heuristics table. No I/O, no randomness: equal inputs give equal output.

use std::cmp::Ordering;

use skillos_core::heuristics::HeuristicTable;
use skillos_core::{HandlerManifest, RoutingMode};

/// Similarity between a task and a handler, in `[-1, 1]`.
///
/// Implementations wrap an embedding index or similar; the router never
/// computes embeddings itself.
pub trait SimilarityProvider: Send + Sync {
    fn similarity(&self, text: &str, manifest: &HandlerManifest) -> f64;
}

/// A scored handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub handler: String,
    pub score: f64,
    pub confidence: f64,
    pub priority: i32,
    pub rationale: Vec<String>,
}

/// Scoring weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub semantic_weight: f64,
    pub confidence_k: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic_weight: 1.0,
            confidence_k: 1.0,
        }
    }
}

/// Lowercased word tokens (split on anything that is not alphanumeric).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// A single-word trigger matches a token; a phrase matches when its tokens
/// appear contiguously in the task.
pub fn trigger_matches(trigger: &str, tokens: &[String]) -> bool {
    let needle = tokenize(trigger);
    match needle.len() {
        0 => false,
        1 => tokens.iter().any(|t| *t == needle[0]),
        n => tokens.windows(n).any(|w| w == needle.as_slice()),
    }
}

/// `s / (s + k)` for positive scores, otherwise 0. Always in `[0, 1]`; a
/// non-positive `k` saturates to 1.
pub fn normalize(score: f64, k: f64) -> f64 {
    if score > 0.0 {
        let k = k.max(f64::MIN_POSITIVE);
        (score / (score + k)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Confidence desc, then priority desc, then name asc.
pub fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(b.priority.cmp(&a.priority))
        .then_with(|| a.handler.cmp(&b.handler))
}

/// Score every eligible manifest and return the ranked candidates with a
/// positive score.
pub fn score_candidates<'a>(
    text: &str,
    manifests: impl Iterator<Item = &'a HandlerManifest>,
    mode: RoutingMode,
    heuristics: &HeuristicTable,
    similarity: Option<&dyn SimilarityProvider>,
    weights: ScoreWeights,
) -> Vec<Candidate> {
    let lowered = text.to_lowercase();
    let tokens = tokenize(text);
    let boosts: Vec<_> = heuristics.matching(&lowered, &tokens).collect();
    let semantic = similarity.filter(|_| mode != RoutingMode::Keyword);

    let mut candidates = Vec::new();

    for manifest in manifests {
        let mut score = 0.0;
        let mut rationale = Vec::new();

        for trigger in &manifest.triggers {
            if trigger_matches(trigger, &tokens) {
                score += 1.0;
                rationale.push(format!("keyword:{trigger}"));
            }
        }

        for heuristic in boosts.iter().filter(|h| h.handler == manifest.name) {
            score += heuristic.weighted_boost();
            rationale.push(format!("heuristic:{}", heuristic.id));
        }

        let is_candidate = !rationale.is_empty() || mode == RoutingMode::Semantic;
        if let Some(provider) = semantic.filter(|_| is_candidate) {
            let sim = provider.similarity(text, manifest).clamp(-1.0, 1.0);
            score += weights.semantic_weight * sim;
            rationale.push(format!("semantic:{sim:.2}"));
        } else if !is_candidate {
            continue;
        }

        if score > 0.0 {
            candidates.push(Candidate {
                handler: manifest.name.clone(),
                score,
                confidence: normalize(score, weights.confidence_k),
                priority: manifest.priority,
                rationale,
            });
        }
    }

    candidates.sort_by(rank);
    candidates
}
