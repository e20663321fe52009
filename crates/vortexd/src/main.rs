//! vortexd: the VortexL2 tunnel watchdog daemon.
//!
//! Loads `config.toml`, supervises every enabled tunnel, and keeps a
//! JSON status file current for the port-forward manager.
//!
//! # Usage
//!
//! ```text
//! vortexd run --config /etc/vortexl2/config.toml --status-file /run/vortexl2/status.json
//! vortexd check --config /etc/vortexl2/config.toml
//! vortexd init --role iran --ip-iran 203.0.113.10 --ip-kharej 198.51.100.20
//! ```

mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vortex_core::config::DEFAULT_CONFIG_PATH;
use vortex_core::{Role, VortexConfig};
use vortex_health::{LogAlertSink, SupervisorDeps, SystemRunner, WatchdogCoordinator};

use crate::status::StatusWriter;

const DEFAULT_LOG_FILTER: &str = "info,vortexd=debug,vortex_health=debug";

#[derive(Parser)]
#[command(name = "vortexd", about = "VortexL2 tunnel watchdog daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise all enabled tunnels until interrupted.
    Run {
        /// Path to config.toml.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Where to write the JSON status snapshot.
        #[arg(long)]
        status_file: Option<PathBuf>,

        /// Status file refresh interval in seconds.
        #[arg(long, default_value = "5")]
        status_interval: u64,
    },

    /// Validate the config and print the resolved tunnels as JSON.
    Check {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print a starter config for one tunnel.
    Init {
        #[arg(long, value_parser = parse_role)]
        role: Role,

        #[arg(long)]
        ip_iran: String,

        #[arg(long)]
        ip_kharej: String,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s.to_ascii_lowercase().as_str() {
        "iran" => Ok(Role::Iran),
        "kharej" => Ok(Role::Kharej),
        other => Err(format!("unknown role {other:?}, expected `iran` or `kharej`")),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            status_file,
            status_interval,
        } => run(config, status_file, status_interval).await,
        Command::Check { config } => check(config),
        Command::Init {
            role,
            ip_iran,
            ip_kharej,
        } => init(role, &ip_iran, &ip_kharej),
    }
}

fn load_config(path: &Path) -> anyhow::Result<VortexConfig> {
    VortexConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(
    config_path: PathBuf,
    status_file: Option<PathBuf>,
    status_interval: u64,
) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let settings = config.settings()?;
    let specs = config.tunnel_specs()?;

    info!(
        config = %config_path.display(),
        tunnels = specs.len(),
        probe_interval = ?settings.probe_interval,
        failure_threshold = settings.failure_threshold,
        recovery_threshold = settings.recovery_threshold,
        max_retries = settings.max_retries,
        "VortexL2 watchdog starting"
    );

    let deps = SupervisorDeps::system(Arc::new(SystemRunner), &settings, Arc::new(LogAlertSink));
    let coordinator = Arc::new(WatchdogCoordinator::new(settings, deps));

    for spec in specs {
        if !spec.enabled {
            info!(tunnel = %spec.name, "tunnel disabled, not supervised");
            continue;
        }
        coordinator.register(spec).await?;
    }
    if coordinator.active_tunnels().await.is_empty() {
        warn!("no enabled tunnels configured");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let status_handle = status_file.map(|path| {
        let writer = StatusWriter::new(
            coordinator.clone(),
            path,
            Duration::from_secs(status_interval.max(1)),
        );
        tokio::spawn(async move {
            writer.run(shutdown_rx).await;
        })
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    // Final status write sees the last live snapshot.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = status_handle {
        let _ = handle.await;
    }

    let aborted = coordinator.shutdown().await;
    if aborted > 0 {
        warn!(aborted, "some supervisors were aborted mid-cycle");
    }

    info!("VortexL2 watchdog stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn check(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let settings = config.settings()?;
    let specs = config.tunnel_specs()?;

    let enabled = specs.iter().filter(|s| s.enabled).count();
    info!(
        tunnels = specs.len(),
        enabled,
        probe_interval = ?settings.probe_interval,
        "configuration valid"
    );
    println!("{}", serde_json::to_string_pretty(&specs)?);
    Ok(())
}

fn init(role: Role, ip_iran: &str, ip_kharej: &str) -> anyhow::Result<()> {
    let config = VortexConfig::scaffold(role, ip_iran, ip_kharej);
    // Refuse to print something `run` would reject.
    config.settings()?;
    config.tunnel_specs()?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
