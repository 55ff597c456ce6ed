use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_text;
use crate::registry::{Handler, HandlerContext, HandlerError};

pub(super) const MANIFEST: &str = r#"
name: research
version: 1.0.0
description: Look up sources and answer factual questions.
triggers: [research, find, "look up", investigate, "what is", "who is"]
examples:
  - research the latest rust release
  - find papers on circuit breakers
tags: [web, facts]
cost: 1.0
priority: 9
mutually_exclusive_with: [research]
"#;

/// Offline research stub: echoes the query back as an answer with no sources.
#[derive(Debug, Default)]
pub struct ResearchHandler;

#[async_trait]
impl Handler for ResearchHandler {
    async fn execute(&self, payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let query = require_text(&payload, &["query", "text"])?;
        Ok(json!({
            "answer": format!("Offline-mode research fallback for: {query}"),
            "sources": [],
            "confidence": 0.4,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillos_core::Id;

    fn ctx() -> HandlerContext {
        HandlerContext {
            trace_id: Id::new(),
            run_id: Id::new(),
            step_id: Id::new(),
            attempt: 1,
            memory: None,
        }
    }

    #[tokio::test]
    async fn answers_offline() {
        let out = ResearchHandler
            .execute(json!({ "text": "rust 2024 edition" }), &ctx())
            .await
            .unwrap();
        assert_eq!(out["answer"], "Offline-mode research fallback for: rust 2024 edition");
        assert_eq!(out["sources"], json!([]));
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let err = ResearchHandler
            .execute(json!({ "text": "" }), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidInput(_)));
    }
}
