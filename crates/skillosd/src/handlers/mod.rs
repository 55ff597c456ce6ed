//! Built-in handlers.
//!
//! Small offline implementations used by the daemon out of the box and by
//! the integration tests. Each carries its manifest as embedded YAML.

mod memory_search;
mod research;
mod summarize;

pub use memory_search::MemorySearchHandler;
pub use research::ResearchHandler;
pub use summarize::SummarizeHandler;

use std::sync::Arc;

use serde_json::Value;
use skillos_core::HandlerManifest;

use crate::registry::{HandlerError, HandlerRegistry, HandlerRegistryBuilder, RegistryError};

/// Add every built-in handler to `builder`.
pub fn register_builtins(
    builder: HandlerRegistryBuilder,
) -> Result<HandlerRegistryBuilder, RegistryError> {
    builder
        .register(
            HandlerManifest::from_yaml(research::MANIFEST)?,
            Arc::new(ResearchHandler),
        )?
        .register(
            HandlerManifest::from_yaml(summarize::MANIFEST)?,
            Arc::new(SummarizeHandler),
        )?
        .register(
            HandlerManifest::from_yaml(memory_search::MANIFEST)?,
            Arc::new(MemorySearchHandler::default()),
        )
}

/// Registry holding only the built-in handlers.
pub fn builtin_registry() -> Result<HandlerRegistry, RegistryError> {
    Ok(register_builtins(HandlerRegistry::builder())?.build())
}

/// Non-empty trimmed string at `key`.
fn text_param<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn require_text<'a>(payload: &'a Value, keys: &[&str]) -> Result<&'a str, HandlerError> {
    keys.iter()
        .find_map(|key| text_param(payload, key))
        .ok_or_else(|| HandlerError::InvalidInput(format!("missing '{}' parameter", keys[0])))
}
