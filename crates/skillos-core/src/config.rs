//! Configuration parsing for the skill router daemon.
//!
//! Uses a flat key=value format with `#` comments and optional quoting.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::types::{BreakerAccounting, RoutingMode};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid number for {key}: {value}")]
    InvalidFloat { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Router, invoker, breaker and daemon settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Run limits
    pub max_steps: u32,
    pub step_timeout_sec: u32,

    // Invoker retry policy
    pub retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout_sec: u32,
    pub breaker_half_open_trials: u32,
    pub breaker_accounting: BreakerAccounting,
    /// SQLite file shared between processes. In-process state when unset.
    pub circuit_store_path: Option<PathBuf>,

    // Routing
    pub routing_mode: RoutingMode,
    /// Best candidate below this confidence triggers the fallback.
    pub min_confidence: f64,
    /// Saturation constant `k` in `s / (s + k)`.
    pub confidence_k: f64,
    /// Weight applied to similarity scores.
    pub semantic_weight: f64,
    pub default_handler: Option<String>,
    /// JSON file holding learned routing boosts.
    pub heuristics_path: Option<PathBuf>,

    // Memory collaborator
    pub memory_enabled: bool,
    pub memory_timeout_ms: u64,
    /// Oldest records are dropped once the store holds this many.
    pub memory_max_records: usize,

    // HTTP control plane
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_steps: 5,
            step_timeout_sec: 30,
            retries: 2,
            retry_backoff_ms: 500,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_sec: 30,
            breaker_half_open_trials: 1,
            breaker_accounting: BreakerAccounting::PerStep,
            circuit_store_path: None,
            routing_mode: RoutingMode::Hybrid,
            min_confidence: 0.3,
            confidence_k: 1.0,
            semantic_weight: 1.0,
            default_handler: None,
            heuristics_path: None,
            memory_enabled: true,
            memory_timeout_ms: 250,
            memory_max_records: 1000,
            port: 7800,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_steps" => self.max_steps = Self::parse_int(key, value)?,
            "step_timeout_sec" => self.step_timeout_sec = Self::parse_int(key, value)?,
            "retries" => self.retries = Self::parse_int(key, value)?,
            "retry_backoff_ms" => self.retry_backoff_ms = Self::parse_int(key, value)?,
            "breaker_failure_threshold" => {
                self.breaker_failure_threshold = Self::parse_int(key, value)?;
            }
            "breaker_recovery_timeout_sec" => {
                self.breaker_recovery_timeout_sec = Self::parse_int(key, value)?;
            }
            "breaker_half_open_trials" => {
                self.breaker_half_open_trials = Self::parse_int(key, value)?;
            }
            "breaker_accounting" => {
                self.breaker_accounting = match value {
                    "per_step" => BreakerAccounting::PerStep,
                    "per_attempt" => BreakerAccounting::PerAttempt,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "breaker_accounting must be 'per_step' or 'per_attempt', got '{value}'"
                        )))
                    }
                }
            }
            "circuit_store_path" => self.circuit_store_path = Self::optional_path(value),
            "routing_mode" => {
                self.routing_mode = RoutingMode::parse(value).ok_or_else(|| {
                    ConfigError::InvalidLine(format!(
                        "routing_mode must be 'keyword', 'hybrid', or 'semantic', got '{value}'"
                    ))
                })?;
            }
            "min_confidence" => self.min_confidence = Self::parse_unit(key, value)?,
            "confidence_k" => {
                let k = Self::parse_float(key, value)?;
                if k <= 0.0 {
                    return Err(ConfigError::InvalidFloat {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.confidence_k = k;
            }
            "semantic_weight" => self.semantic_weight = Self::parse_float(key, value)?,
            "default_handler" => {
                self.default_handler = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "heuristics_path" => self.heuristics_path = Self::optional_path(value),
            "memory_enabled" => self.memory_enabled = Self::parse_bool(key, value)?,
            "memory_timeout_ms" => self.memory_timeout_ms = Self::parse_int(key, value)?,
            "memory_max_records" => {
                let max: usize = Self::parse_int(key, value)?;
                if max == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.memory_max_records = max;
            }
            "port" => self.port = Self::parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn optional_path(value: &str) -> Option<PathBuf> {
        if value.is_empty() {
            None
        } else {
            Some(PathBuf::from(value))
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_float(key: &str, value: &str) -> Result<f64, ConfigError> {
        match value.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(ConfigError::InvalidFloat {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Parse a float restricted to `[0, 1]`.
    fn parse_unit(key: &str, value: &str) -> Result<f64, ConfigError> {
        let v = Self::parse_float(key, value)?;
        if (0.0..=1.0).contains(&v) {
            Ok(v)
        } else {
            Err(ConfigError::InvalidFloat {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a base directory (usually the
    /// directory holding the config file).
    pub fn resolve_paths(&mut self, base: &Path) {
        if let Some(ref path) = self.heuristics_path {
            if path.is_relative() {
                self.heuristics_path = Some(base.join(path));
            }
        }
        if let Some(ref path) = self.circuit_store_path {
            if path.is_relative() {
                self.circuit_store_path = Some(base.join(path));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.retries, 2);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_recovery_timeout_sec, 30);
        assert_eq!(config.breaker_half_open_trials, 1);
        assert_eq!(config.breaker_accounting, BreakerAccounting::PerStep);
        assert_eq!(config.routing_mode, RoutingMode::Hybrid);
        assert!((config.min_confidence - 0.3).abs() < f64::EPSILON);
        assert!(config.default_handler.is_none());
        assert!(config.circuit_store_path.is_none());
        assert_eq!(config.memory_max_records, 1000);
    }

    #[test]
    fn memory_capacity_must_be_positive() {
        let mut config = Config::default();
        config.parse_content("memory_max_records=25").unwrap();
        assert_eq!(config.memory_max_records, 25);
        assert!(matches!(
            config.parse_content("memory_max_records=0"),
            Err(ConfigError::InvalidInt { .. })
        ));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# routing
routing_mode=keyword
min_confidence=0.5
default_handler="summarize"
max_steps=3
retries=0
breaker_accounting=per_attempt
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.routing_mode, RoutingMode::Keyword);
        assert!((config.min_confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.default_handler.as_deref(), Some("summarize"));
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.retries, 0);
        assert_eq!(config.breaker_accounting, BreakerAccounting::PerAttempt);
    }

    #[test]
    fn empty_default_handler_clears_it() {
        let mut config = Config::default();
        config.parse_content("default_handler=research\ndefault_handler=").unwrap();
        assert!(config.default_handler.is_none());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "yes").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut config = Config::default();
        let err = config.parse_content("min_confidence=1.5").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFloat { .. }));
        let err = config.parse_content("confidence_k=0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFloat { .. }));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_lines() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("frobnicate=1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            config.parse_content("no equals sign"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("retries=-1"),
            Err(ConfigError::InvalidInt { .. })
        ));
    }

    #[test]
    fn from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skillos.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "heuristics_path=heuristics.json").unwrap();
        writeln!(file, "circuit_store_path=/var/lib/skillos/circuits.db").unwrap();

        let mut config = Config::from_file(&path).unwrap();
        config.resolve_paths(dir.path());
        assert_eq!(
            config.heuristics_path,
            Some(dir.path().join("heuristics.json"))
        );
        assert_eq!(
            config.circuit_store_path,
            Some(PathBuf::from("/var/lib/skillos/circuits.db"))
        );
    }
}
