//! prime-pair — WhatsApp pairing-code session generator.
//!
//! Subcommands:
//! - `serve` — run the HTTP/WebSocket gateway (default)
//! - `pair`  — pair a phone number from the terminal
//! - `check` — verify sessions dir, bridge, paste key, and audit DB

mod api;
mod gateway;
mod pair;
mod selfcheck;

use chrono::Utc;
use clap::{Parser, Subcommand};
use gateway::{Gateway, Settings};
use prime_channels::BridgeClientFactory;
use prime_core::config::{Config, LoggingConfig};
use prime_core::shellexpand;
use prime_memory::AuditLogger;
use prime_paste::PastebinClient;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "prime-pair",
    version,
    about = "WhatsApp pairing-code session generator"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, env = "PRIME_CONFIG", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket gateway.
    Serve,
    /// Pair a phone number from the terminal.
    Pair {
        /// Phone number in international format, digits only (e.g. 15551234567).
        phone_number: String,
    },
    /// Check that every collaborator is reachable.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let _guard = init_logging(&config.logging, true)?;
            install_panic_hook();
            let gateway = build_gateway(&config).await?;
            gateway.run(config.server.clone()).await
        }
        Commands::Pair { phone_number } => {
            // File only: stdout belongs to the interactive prompt.
            let _guard = init_logging(&config.logging, false)?;
            install_panic_hook();
            let gateway = build_gateway(&config).await?;
            pair::pair_phone(gateway, &phone_number).await
        }
        Commands::Check => {
            if !selfcheck::run(&config).await {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Install the tracing subscriber: env filter, optional stdout, daily log file.
fn init_logging(logging: &LoggingConfig, stdout: bool) -> anyhow::Result<WorkerGuard> {
    let log_dir = shellexpand(&logging.dir);
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, "prime-pair.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout.then(|| fmt::layer().with_target(false)))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    Ok(guard)
}

/// Panics inside spawned tasks are logged; the task dies, the process does not.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("panic: {info}");
    }));
}

/// Wire the gateway to the bridge, the paste service, and the audit log.
async fn build_gateway(config: &Config) -> anyhow::Result<Gateway> {
    let settings = Settings::from_config(config)?;
    tokio::fs::create_dir_all(&settings.sessions_root).await?;

    let factory = Arc::new(BridgeClientFactory::new(config.bridge.clone()));

    if config.paste.api_key.trim().is_empty() {
        warn!("paste.api_key is empty, credential export will fail until it is set");
    }
    let paste = Arc::new(PastebinClient::new(
        &config.paste.api_url,
        &config.paste.api_key,
    )?);

    let audit = if config.audit.enabled {
        match AuditLogger::open(&config.audit.db_path).await {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!("audit log unavailable, continuing without it: {e}");
                None
            }
        }
    } else {
        None
    };

    let gateway = Gateway::new(factory, paste, audit, settings);

    // Workspaces left behind by a previous run.
    let report = gateway.sweep(Utc::now()).await;
    if report.orphans > 0 {
        info!("startup: removed {} orphaned workspace(s)", report.orphans);
    }

    Ok(gateway)
}
