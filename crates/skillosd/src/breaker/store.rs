//! Circuit state storage.
//!
//! Stores are dumb: they hold [`CircuitState`] rows and offer two atomic
//! primitives. All transition logic lives in `skillos_core::circuit`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillos_core::{CircuitPhase, CircuitState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt circuit row for {handler}: {reason}")]
    Corrupt { handler: String, reason: String },
    #[error("too much contention updating circuit for {0}")]
    Contention(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CircuitStore: Send + Sync + std::fmt::Debug {
    /// Current state; a fresh closed state (version 0) for unknown handlers.
    async fn get(&self, handler: &str) -> Result<CircuitState>;

    /// Persist `next` only if the stored version still equals
    /// `expected_version`. Returns whether the write happened.
    async fn compare_and_set(&self, expected_version: u64, next: &CircuitState) -> Result<bool>;

    /// Atomically add one failure to a `CLOSED` breaker and return the new
    /// state. `None` when the breaker is not closed.
    async fn increment_failure(
        &self,
        handler: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<CircuitState>>;

    async fn list(&self) -> Result<Vec<CircuitState>>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Mutex-guarded map; the default store and the degraded-mode fallback.
#[derive(Debug, Default)]
pub struct InMemoryCircuitStore {
    states: Mutex<HashMap<String, CircuitState>>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CircuitState>>> {
        self.states
            .lock()
            .map_err(|_| StoreError::Unavailable("circuit lock poisoned".to_string()))
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn get(&self, handler: &str) -> Result<CircuitState> {
        Ok(self
            .locked()?
            .get(handler)
            .cloned()
            .unwrap_or_else(|| CircuitState::closed(handler)))
    }

    async fn compare_and_set(&self, expected_version: u64, next: &CircuitState) -> Result<bool> {
        let mut states = self.locked()?;
        let current = states.get(&next.handler).map_or(0, |s| s.version);
        if current != expected_version {
            return Ok(false);
        }
        states.insert(next.handler.clone(), next.clone());
        Ok(true)
    }

    async fn increment_failure(
        &self,
        handler: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<CircuitState>> {
        let mut states = self.locked()?;
        let state = states
            .entry(handler.to_string())
            .or_insert_with(|| CircuitState::closed(handler));
        if state.phase != CircuitPhase::Closed {
            return Ok(None);
        }
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(at);
        state.version += 1;
        Ok(Some(state.clone()))
    }

    async fn list(&self) -> Result<Vec<CircuitState>> {
        let mut states: Vec<CircuitState> = self.locked()?.values().cloned().collect();
        states.sort_by(|a, b| a.handler.cmp(&b.handler));
        Ok(states)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_handler_reads_as_closed() {
        let store = InMemoryCircuitStore::new();
        let state = store.get("search").await.unwrap();
        assert_eq!(state.phase, CircuitPhase::Closed);
        assert_eq!(state.version, 0);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_version() {
        let store = InMemoryCircuitStore::new();
        let mut next = CircuitState::closed("search");
        next.version = 1;
        next.failure_count = 1;
        assert!(store.compare_and_set(0, &next).await.unwrap());

        let mut stale = next.clone();
        stale.version = 1;
        assert!(!store.compare_and_set(0, &stale).await.unwrap());
        assert_eq!(store.get("search").await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn increment_only_touches_closed_breakers() {
        let store = InMemoryCircuitStore::new();
        let now = Utc::now();
        let state = store.increment_failure("search", now).await.unwrap().unwrap();
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.version, 1);

        let mut open = state.clone();
        open.phase = CircuitPhase::Open;
        open.version = 2;
        assert!(store.compare_and_set(1, &open).await.unwrap());
        assert!(store.increment_failure("search", now).await.unwrap().is_none());
    }
}
