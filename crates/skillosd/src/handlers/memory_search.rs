use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_text;
use crate::registry::{Handler, HandlerContext, HandlerError};

pub(super) const MANIFEST: &str = r#"
name: memory-search
version: 1.0.0
description: Search earlier steps and runs for records relevant to the query.
triggers: [remember, recall, memory, previous, earlier]
examples:
  - what did we find about circuit breakers earlier
tags: [memory]
cost: 0.1
priority: 10
mutually_exclusive_with: [memory-search]
requires_context: [memory]
input_required: [query]
"#;

/// Searches the run's memory store.
#[derive(Debug)]
pub struct MemorySearchHandler {
    limit: usize,
}

impl Default for MemorySearchHandler {
    fn default() -> Self {
        Self { limit: 5 }
    }
}

#[async_trait]
impl Handler for MemorySearchHandler {
    async fn execute(&self, payload: Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let query = require_text(&payload, &["query", "text"])?;
        let memory = ctx
            .memory
            .as_ref()
            .ok_or_else(|| HandlerError::Failed("no memory store attached".to_string()))?;

        let records = memory
            .search(query, self.limit)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let matches: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "task": r.task,
                    "handler": r.handler,
                    "observation": r.observation,
                    "run_id": r.run_id,
                })
            })
            .collect();
        let confidence = if matches.is_empty() { 0.3 } else { 0.7 };

        Ok(json!({
            "query": query,
            "matches": matches,
            "confidence": confidence,
        }))
    }
}
