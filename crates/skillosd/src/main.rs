//! skillosd - skill routing daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use skillos_core::{Config, RoutingMode, RunConfig};
use skillosd::{default_config_path, Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "skillosd", about = "Skill routing daemon", version)]
struct Cli {
    /// Config file (key=value). Defaults to ~/.config/skillosd/skillosd.conf when present.
    #[arg(short, long, env = "SKILLOSD_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared SQLite file for circuit breaker state
    #[arg(long)]
    circuit_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single task and print the result as JSON
    Run {
        task: String,
        #[arg(long)]
        max_steps: Option<u32>,
        #[arg(long)]
        timeout_seconds: Option<f64>,
        /// keyword, hybrid or semantic
        #[arg(long, value_parser = parse_routing_mode)]
        routing_mode: Option<RoutingMode>,
    },
}

fn parse_routing_mode(value: &str) -> Result<RoutingMode, String> {
    RoutingMode::parse(value).ok_or_else(|| format!("unknown routing mode: {value}"))
}

/// CLI flags > config file > defaults.
fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Some(default_config_path()).filter(|p| p.exists()),
    };

    let mut config = Config::default();
    if let Some(path) = path {
        config
            .load_file(&path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
    }

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(store) = &cli.circuit_store {
        config.circuit_store_path = Some(store.clone());
    }
    Ok(config)
}

async fn run_once(daemon: &Daemon, task: &str, config: RunConfig) -> eyre::Result<()> {
    let result = daemon
        .orchestrator()
        .run(task, config, daemon.shutdown_token().child_token())
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };

    let run_defaults = RunConfig::from_config(&config);
    let daemon_config = DaemonConfig {
        config,
        ..Default::default()
    };

    // Run the async main.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let daemon = match Daemon::new(daemon_config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {e:#}");
                return 1;
            }
        };

        if let Some(Command::Run {
            task,
            max_steps,
            timeout_seconds,
            routing_mode,
        }) = &cli.command
        {
            let run_config = RunConfig {
                max_steps: max_steps.unwrap_or(run_defaults.max_steps),
                timeout_seconds: timeout_seconds.unwrap_or(run_defaults.timeout_seconds),
                routing_mode: routing_mode.unwrap_or(run_defaults.routing_mode),
            };
            return match run_once(&daemon, task, run_config).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("run failed: {e:#}");
                    1
                }
            };
        }

        tokio::select! {
            result = daemon.run() => {
                if let Err(e) = result {
                    error!("daemon error: {e:#}");
                    return 1;
                }
            }
            () = shutdown_signal() => {
                tracing::info!("initiating graceful shutdown");
                daemon.shutdown();
            }
        }
        0
    });

    std::process::exit(code);
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            error!("failed to register signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received SIGINT");
}
