//! skillosd - skill routing daemon
//!
//! Routes natural-language tasks to registered handlers, invokes them behind
//! per-handler circuit breakers, and drives bounded multi-step runs.

pub mod breaker;
pub mod events;
pub mod handlers;
pub mod invoker;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use eyre::WrapErr;
use skillos_core::{BreakerPolicy, Config, HeuristicTable, RunConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use breaker::CircuitRegistry;
use events::EventBus;
use memory::{InMemoryStore, MemoryStore};
use orchestrator::Orchestrator;
use registry::HandlerRegistry;
use server::AppState;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config: Config,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config: Config::default(),
            auth_token: std::env::var("SKILLOSD_AUTH_TOKEN").ok(),
        }
    }
}

/// Default config file location (~/.config/skillosd/skillosd.conf).
pub fn default_config_path() -> PathBuf {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
    config_dir.join("skillosd").join("skillosd.conf")
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the registry, breakers and orchestrator from configuration.
    pub async fn new(config: DaemonConfig) -> eyre::Result<Self> {
        Self::with_registry(config, handlers::builtin_registry()?).await
    }

    /// Like [`Daemon::new`] with a caller-supplied handler registry.
    pub async fn with_registry(
        config: DaemonConfig,
        registry: HandlerRegistry,
    ) -> eyre::Result<Self> {
        let cfg = &config.config;

        if let Some(name) = &cfg.default_handler {
            if !registry.contains(name) {
                eyre::bail!("default_handler '{name}' is not a registered handler");
            }
        }

        let breakers = Arc::new(
            CircuitRegistry::connect(
                BreakerPolicy::from_config(cfg),
                cfg.circuit_store_path.as_deref(),
            )
            .await,
        );

        let heuristics = match &cfg.heuristics_path {
            Some(path) => HeuristicTable::load(path)
                .wrap_err_with(|| format!("failed to load heuristics from {}", path.display()))?,
            None => HeuristicTable::default(),
        };

        let mut builder = Orchestrator::builder(Arc::new(registry))
            .config(cfg)
            .breakers(breakers)
            .events(EventBus::default())
            .heuristics(Arc::new(heuristics));
        if cfg.memory_enabled {
            let memory = InMemoryStore::with_capacity(cfg.memory_max_records);
            builder = builder.memory(Arc::new(memory) as Arc<dyn MemoryStore>);
        }

        Ok(Self {
            orchestrator: Arc::new(builder.build()),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Token cancelled by [`Daemon::shutdown`]; runs use child tokens.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Serve the HTTP API until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        let cfg = &self.config.config;
        info!("skillosd starting on port {}", cfg.port);
        info!(
            handlers = self.orchestrator.registry().len(),
            routing_mode = cfg.routing_mode.as_str(),
            max_steps = cfg.max_steps,
            "orchestrator ready"
        );
        if self.orchestrator.breakers().is_degraded() {
            warn!("circuit breakers running with process-local state");
        }
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let state = Arc::new(AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            auth_token: self.config.auth_token.clone(),
            run_defaults: RunConfig::from_config(cfg),
            shutdown: self.shutdown.clone(),
        });
        let port = cfg.port;
        let mut http_handle = tokio::spawn(async move { server::start_server(state, port).await });

        tokio::select! {
            result = &mut http_handle => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("HTTP server error: {}", e);
                    eyre::bail!("HTTP server failed: {e}");
                }
                Err(e) => eyre::bail!("HTTP server task failed: {e}"),
            },
            () = self.shutdown.cancelled() => {
                info!("shutdown signal received, exiting");
                http_handle.abort();
            }
        }

        Ok(())
    }

    /// Signal the daemon to shut down; in-flight runs stop before their next step.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_default_handler_is_rejected() {
        let mut config = Config::default();
        config.default_handler = Some("ghost".to_string());
        let err = Daemon::new(DaemonConfig {
            config,
            auth_token: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn builds_with_builtin_handlers_and_memory() {
        let daemon = Daemon::new(DaemonConfig {
            config: Config::default(),
            auth_token: None,
        })
        .await
        .unwrap();
        assert_eq!(daemon.orchestrator().registry().len(), 3);
        assert!(!daemon.orchestrator().breakers().is_degraded());
    }

    #[tokio::test]
    async fn missing_heuristics_file_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.heuristics_path = Some(dir.path().join("missing.json"));
        let err = Daemon::new(DaemonConfig {
            config,
            auth_token: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("heuristics"));
    }
}
