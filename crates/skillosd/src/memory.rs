//! Memory collaborator.
//!
//! The run loop writes one record per step and looks up prior answers for
//! early exit. Both calls are best-effort: the caller bounds them with a
//! timeout and only logs failures.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillos_core::Id;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory backend unavailable: {0}")]
    Unavailable(String),
}

/// One remembered step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub run_id: Id,
    pub step_id: Id,
    pub task: String,
    pub handler: String,
    pub success: bool,
    /// Rendered payload (or error message).
    pub observation: String,
    /// Definitive answer produced by the step, if any.
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn write(&self, record: MemoryRecord) -> Result<(), MemoryError>;

    /// Most recent answer previously recorded for the same task.
    async fn lookup(&self, task: &str) -> Result<Option<String>, MemoryError>;

    /// Records ranked by keyword overlap with `query`, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError>;
}

/// Records kept by [`InMemoryStore::new`].
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Process-local memory holding at most `max_records` records. Writes past
/// the limit drop the oldest record.
#[derive(Debug)]
pub struct InMemoryStore {
    records: Mutex<VecDeque<MemoryRecord>>,
    max_records: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_records: usize) -> Self {
        let max_records = max_records.max(1);
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_records
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<MemoryRecord>>, MemoryError> {
        self.records
            .lock()
            .map_err(|_| MemoryError::Unavailable("memory lock poisoned".to_string()))
    }
}

fn normalize(task: &str) -> String {
    task.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn keywords(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn write(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        let mut records = self.locked()?;
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    async fn lookup(&self, task: &str) -> Result<Option<String>, MemoryError> {
        let wanted = normalize(task);
        let records = self.locked()?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| normalize(&r.task) == wanted)
            .find_map(|r| r.answer.clone()))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let query_keywords = keywords(query);
        if query_keywords.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.locked()?;
        let mut scored: Vec<(usize, usize, &MemoryRecord)> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| {
                let mut text = keywords(&r.task);
                text.extend(keywords(&r.observation));
                let overlap = query_keywords.intersection(&text).count();
                (overlap > 0).then_some((overlap, idx, r))
            })
            .collect();
        // Best overlap first, newest first among equals.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, r)| r.clone())
            .collect())
    }
}
