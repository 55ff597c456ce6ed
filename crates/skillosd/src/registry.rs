//! Handler registry.
//!
//! Built once at startup from an explicit registration table; immutable
//! afterwards and shared behind an `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use skillos_core::manifest::ManifestError;
use skillos_core::{HandlerManifest, Id};
use thiserror::Error;

use crate::memory::MemoryStore;

/// Failure reported by a handler implementation.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler ran and failed. Retryable.
    #[error("{0}")]
    Failed(String),
    /// The payload was unusable. Not retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Per-attempt context handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub trace_id: Id,
    pub run_id: Id,
    pub step_id: Id,
    pub attempt: u32,
    pub memory: Option<Arc<dyn MemoryStore>>,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("trace_id", &self.trace_id)
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

/// A pluggable capability.
///
/// Implementations must return a JSON object on success; anything else is
/// treated as a validation failure by the invoker.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, payload: Value, ctx: &HandlerContext) -> Result<Value, HandlerError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("handler already registered: {0}")]
    Duplicate(String),
}

/// A manifest paired with its implementation.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub manifest: HandlerManifest,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("manifest", &self.manifest.name)
            .finish_non_exhaustive()
    }
}

/// Immutable catalog, ordered by name.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredHandler> {
        self.entries.get(name)
    }

    pub fn manifest(&self, name: &str) -> Option<&HandlerManifest> {
        self.entries.get(name).map(|e| &e.manifest)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &HandlerManifest> {
        self.entries.values().map(|e| &e.manifest)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    entries: BTreeMap<String, RegisteredHandler>,
}

impl HandlerRegistryBuilder {
    /// Validate the manifest and add the handler under its name.
    pub fn register(
        mut self,
        manifest: HandlerManifest,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, RegistryError> {
        let manifest = manifest.validate()?;
        if self.entries.contains_key(&manifest.name) {
            return Err(RegistryError::Duplicate(manifest.name));
        }
        self.entries
            .insert(manifest.name.clone(), RegisteredHandler { manifest, handler });
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            entries: self.entries,
        }
    }
}
