use async_trait::async_trait;
use serde_json::{json, Value};

use super::require_text;
use crate::registry::{Handler, HandlerContext, HandlerError};

pub(super) const MANIFEST: &str = r#"
name: summarize
version: 1.0.0
description: Condense text into a short extractive summary.
triggers: [summarize, summary, condense, shorten, "tl;dr"]
examples:
  - summarize this article
  - give me a summary of the findings
tags: [text]
cost: 0.2
priority: 5
"#;

const MAX_SENTENCES: usize = 3;

/// Extractive summarizer: keeps the first few sentences.
///
/// Prefers observations passed in `context` over the raw task text.
#[derive(Debug, Default)]
pub struct SummarizeHandler;

/// Split after `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|(_, next)| next.is_whitespace()) {
            let end = idx + c.len_utf8();
            out.push(text[start..end].trim());
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out.retain(|s| !s.is_empty());
    out
}

#[async_trait]
impl Handler for SummarizeHandler {
    async fn execute(&self, payload: Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let context = payload
            .get("context")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|joined| !joined.trim().is_empty());

        let source = match &context {
            Some(joined) => joined.as_str(),
            None => require_text(&payload, &["text"])?,
        };

        let summary = sentences(source)
            .into_iter()
            .take(MAX_SENTENCES)
            .collect::<Vec<_>>()
            .join(" ");
        let length = summary.split_whitespace().count();

        Ok(json!({
            "summary": summary,
            "length": length,
            "confidence": 0.9,
        }))
    }
}
