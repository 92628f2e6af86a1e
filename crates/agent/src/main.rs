//! Node Agent
//!
//! Serves command, script, terminal, upload and port-probe channels.

use std::path::{Path, PathBuf};

use agent::config::LoggingConfig;
use agent::{AgentState, Config};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Node Agent - remote execution over authenticated WebSocket channels.
#[derive(Parser, Debug)]
#[command(name = "node-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Username required by every channel
    #[arg(short = 'u', long, global = true)]
    pub user: Option<String>,

    /// Password required by every channel
    #[arg(short = 'p', long, global = true)]
    pub password: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving channels
    Serve {
        /// Listen address, e.g. 0.0.0.0:5678 or :5678
        #[arg(short = 'a', long)]
        addr: Option<String>,

        /// PEM certificate chain; enables TLS together with --key
        #[arg(short = 'c', long, value_name = "FILE")]
        cert: Option<PathBuf>,

        /// PEM (PKCS#8) private key
        #[arg(short = 'k', long, value_name = "FILE")]
        key: Option<PathBuf>,
    },

    /// Print the effective configuration with the password masked
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (mut config, source) = Config::discover(cli.config.as_deref())?;

    // Apply environment variable overrides, then flags
    let env_overrides = config.apply_env_overrides();
    apply_cli_overrides(&mut config, &cli);

    // Initialize tracing
    let _log_guard = init_logging(&config.logging, cli.verbose)?;
    match &source {
        Some(path) => tracing::info!("Using config file: {:?}", path),
        None => tracing::info!("No config file found, using defaults"),
    }
    for variable in env_overrides {
        tracing::info!(variable, "Applied override from environment");
    }

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_redacted_toml()?);
        }
        Commands::Serve { .. } => {
            // Validate configuration
            config.validate()?;

            for program in config.missing_interpreters() {
                tracing::warn!(program = %program, "Script interpreter not found on PATH");
            }

            tracing::info!("Node agent {} starting", env!("CARGO_PKG_VERSION"));
            let state = AgentState::from_config(&config)?;
            agent::server::serve(&config, state, wait_for_shutdown_signal()).await?;
            tracing::info!("Node agent stopped");
        }
    }

    Ok(())
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(user) = &cli.user {
        config.auth.user = user.clone();
    }
    if let Some(password) = &cli.password {
        config.auth.password = password.clone();
    }

    if let Commands::Serve { addr, cert, key } = &cli.command {
        if let Some(addr) = addr {
            match addr.strip_prefix(':') {
                Some(port) => config.set_port(port),
                None => config.server.addr = addr.clone(),
            }
        }
        if let Some(cert) = cert {
            config.server.cert_file = Some(cert.clone());
        }
        if let Some(key) = key {
            config.server.key_file = Some(key.clone());
        }
    }
}

/// Install the stdout layer and, when configured, the append-only file layer.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},tower_http=info", level.to_lowercase()).into());

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to register signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
