//! Learned routing boosts.
//!
//! The table is produced offline (from run history) and loaded read-only at
//! startup. Each entry boosts one handler when its condition matches the task
//! text; the applied boost is `boost * confidence`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeuristicError {
    #[error("failed to read heuristics file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid heuristics JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("heuristic {id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// When an entry applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeuristicCondition {
    /// Case-insensitive substring of the task text.
    Contains { phrase: String },
    /// Any of the keywords is a task token.
    KeywordsAny { keywords: Vec<String> },
    /// All of the keywords are task tokens.
    KeywordsAll { keywords: Vec<String> },
}

impl HeuristicCondition {
    /// `text` is the lowercased task and `tokens` its word tokens.
    pub fn matches(&self, text: &str, tokens: &[String]) -> bool {
        let has = |kw: &String| tokens.iter().any(|t| t.eq_ignore_ascii_case(kw));
        match self {
            Self::Contains { phrase } => text.contains(&phrase.to_lowercase()),
            Self::KeywordsAny { keywords } => keywords.iter().any(has),
            Self::KeywordsAll { keywords } => !keywords.is_empty() && keywords.iter().all(has),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heuristic {
    pub id: String,
    pub condition: HeuristicCondition,
    pub handler: String,
    pub boost: f64,
    /// Trust in the boost, `[0, 1]`.
    pub confidence: f64,
    /// Number of runs that produced this entry. Informational.
    #[serde(default)]
    pub evidence_count: u32,
}

impl Heuristic {
    pub fn weighted_boost(&self) -> f64 {
        self.boost * self.confidence
    }
}

/// Immutable set of heuristics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeuristicTable {
    entries: Vec<Heuristic>,
}

impl HeuristicTable {
    pub fn new(entries: Vec<Heuristic>) -> Result<Self, HeuristicError> {
        for entry in &entries {
            if !entry.boost.is_finite() {
                return Err(HeuristicError::Invalid {
                    id: entry.id.clone(),
                    reason: "boost must be finite".to_string(),
                });
            }
            if !(0.0..=1.0).contains(&entry.confidence) {
                return Err(HeuristicError::Invalid {
                    id: entry.id.clone(),
                    reason: format!("confidence {} outside [0, 1]", entry.confidence),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json(content: &str) -> Result<Self, HeuristicError> {
        let entries: Vec<Heuristic> = serde_json::from_str(content)?;
        Self::new(entries)
    }

    pub fn load(path: &Path) -> Result<Self, HeuristicError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn entries(&self) -> &[Heuristic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose condition matches, in table order.
    pub fn matching<'a>(
        &'a self,
        text: &'a str,
        tokens: &'a [String],
    ) -> impl Iterator<Item = &'a Heuristic> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.condition.matches(text, tokens))
    }
}
