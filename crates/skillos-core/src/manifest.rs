//! Handler manifests: the static description the router scores against.
//!
//! Manifests are plain YAML documents:
//!
//! ```yaml
//! name: research
//! version: 1.0.0
//! description: Look up sources and answer factual questions.
//! triggers: [research, find, "look up"]
//! priority: 9
//! mutually_exclusive_with: [research]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Immutable description of a registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerManifest {
    /// Unique key (1-64 chars, lowercase alphanumeric + hyphens).
    pub name: String,
    /// `MAJOR.MINOR.PATCH`.
    pub version: String,
    pub description: String,
    /// Keywords or multi-word phrases matched against task tokens.
    #[serde(default)]
    pub triggers: BTreeSet<String>,
    /// Example tasks, used by similarity providers.
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cost: f64,
    /// Higher wins confidence ties.
    #[serde(default)]
    pub priority: i32,
    /// Handlers that must not run immediately after this one.
    #[serde(default)]
    pub mutually_exclusive_with: BTreeSet<String>,
    /// Capability flags the run context must provide.
    #[serde(default)]
    pub requires_context: BTreeSet<String>,
    /// Payload keys the handler reads.
    #[serde(default = "default_input_required")]
    pub input_required: Vec<String>,
}

fn default_input_required() -> Vec<String> {
    vec!["text".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid YAML manifest: {0}")]
    InvalidYaml(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("invalid description: {0}")]
    InvalidDescription(String),
    #[error("invalid cost for {name}: {cost}")]
    InvalidCost { name: String, cost: String },
    #[error("invalid trigger for {name}: {reason}")]
    InvalidTrigger { name: String, reason: String },
}

/// Validates a handler name.
///
/// Rules:
/// - 1-64 characters
/// - Lowercase letters, numbers, and hyphens only
/// - Must not start or end with hyphen
/// - Must not contain consecutive hyphens
pub fn validate_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty() {
        return Err(ManifestError::InvalidName("name cannot be empty".to_string()));
    }
    if name.len() > 64 {
        return Err(ManifestError::InvalidName(format!(
            "name exceeds 64 characters (got {})",
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(ManifestError::InvalidName(
            "name cannot start or end with hyphen".to_string(),
        ));
    }
    if name.contains("--") {
        return Err(ManifestError::InvalidName(
            "name cannot contain consecutive hyphens".to_string(),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
    {
        return Err(ManifestError::InvalidName(format!(
            "invalid character '{c}': only lowercase letters, numbers, and hyphens allowed"
        )));
    }
    Ok(())
}

/// Validates a `MAJOR.MINOR.PATCH` version string.
pub fn validate_version(version: &str) -> Result<(), ManifestError> {
    let parts: Vec<&str> = version.split('.').collect();
    let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    if parts.len() != 3 || !parts.iter().all(numeric) {
        return Err(ManifestError::InvalidVersion(format!(
            "expected MAJOR.MINOR.PATCH, got '{version}'"
        )));
    }
    Ok(())
}

/// Validates a description (1-1024 characters).
pub fn validate_description(description: &str) -> Result<(), ManifestError> {
    if description.trim().is_empty() {
        return Err(ManifestError::InvalidDescription(
            "description cannot be empty".to_string(),
        ));
    }
    if description.len() > 1024 {
        return Err(ManifestError::InvalidDescription(format!(
            "description exceeds 1024 characters (got {})",
            description.len()
        )));
    }
    Ok(())
}

impl HandlerManifest {
    /// Minimal manifest with default optional fields.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            triggers: BTreeSet::new(),
            examples: Vec::new(),
            tags: Vec::new(),
            cost: 0.0,
            priority: 0,
            mutually_exclusive_with: BTreeSet::new(),
            requires_context: BTreeSet::new(),
            input_required: default_input_required(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_exclusions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutually_exclusive_with = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_context<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_context = flags.into_iter().map(Into::into).collect();
        self
    }

    /// Check every field and normalize triggers to lowercase.
    pub fn validate(mut self) -> Result<Self, ManifestError> {
        validate_name(&self.name)?;
        validate_version(&self.version)?;
        validate_description(&self.description)?;
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(ManifestError::InvalidCost {
                name: self.name,
                cost: self.cost.to_string(),
            });
        }
        let mut triggers = BTreeSet::new();
        for trigger in &self.triggers {
            let normalized = trigger.trim().to_lowercase();
            if normalized.is_empty() {
                return Err(ManifestError::InvalidTrigger {
                    name: self.name.clone(),
                    reason: "trigger cannot be empty".to_string(),
                });
            }
            triggers.insert(normalized);
        }
        self.triggers = triggers;
        Ok(self)
    }

    /// Parse and validate a YAML manifest.
    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_yaml::from_str(content)
            .map_err(|e| ManifestError::InvalidYaml(e.to_string()))?;
        manifest.validate()
    }
}
