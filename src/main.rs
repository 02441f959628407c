//! # chorus
//!
//! Broadcast chat service binary: wires settings, telemetry, the message log
//! and the server together, or runs a standalone relay hub.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chorus_core::InstanceId;
use chorus_server::relay::{RelayHub, TcpRelay, TcpRelayOptions};
use chorus_server::{ChorusServer, ServerConfig, Topology};
use chorus_settings::{ChorusSettings, LoggingSettings, RelayMode, RelaySettings};
use chorus_store::{Database, SqliteLog};
use chorus_telemetry::TelemetryConfig;
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Broadcast chat service with exactly-once ingestion and gap recovery.
#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Broadcast chat service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a service instance (default).
    Serve(ServeArgs),
    /// Run a standalone relay hub for multi-instance deployments.
    Hub(HubArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Settings file (defaults to `~/.chorus/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct HubArgs {
    /// Address to listen on (defaults to `relay.hubAddr`).
    #[arg(long)]
    listen: Option<String>,

    /// Settings file (defaults to `~/.chorus/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load(config: Option<&PathBuf>) -> Result<ChorusSettings> {
    let settings = match config {
        Some(path) => chorus_settings::load_settings_from_path(path),
        None => chorus_settings::load_settings(),
    };
    settings.context("failed to load settings")
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    let log_level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let module_levels = logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| level.parse::<Level>().ok().map(|l| (module.clone(), l)))
        .collect();
    TelemetryConfig {
        log_level,
        module_levels,
        json: logging.json,
        metrics_enabled: logging.metrics_enabled,
    }
}

fn relay_options(relay: &RelaySettings) -> TcpRelayOptions {
    TcpRelayOptions {
        max_frame_size: relay.max_frame_size,
        max_backoff: Duration::from_secs(relay.reconnect_max_backoff_secs),
        ..TcpRelayOptions::default()
    }
}

/// Build the fan-out topology, starting an embedded hub when configured.
async fn build_topology(
    relay: &RelaySettings,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Topology> {
    match relay.mode {
        RelayMode::Direct => Ok(Topology::Direct),
        RelayMode::Tcp => {
            if relay.embed_hub {
                let hub = RelayHub::bind(&relay.hub_addr, relay.max_frame_size)
                    .await
                    .with_context(|| format!("failed to bind relay hub on {}", relay.hub_addr))?;
                tasks.push(tokio::spawn(hub.run(cancel.clone())));
            }
            let client = TcpRelay::connect(relay.hub_addr.clone(), relay_options(relay), cancel);
            Ok(Topology::Relayed(Arc::new(client)))
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load(args.config.as_ref())?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    let telemetry = chorus_telemetry::init_telemetry(telemetry_config(&settings.logging));

    let db_path = settings.storage.db_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    if settings.storage.reset_on_start {
        warn!(path = %db_path.display(), "resetting message log");
        db.reset().context("failed to reset message log")?;
    }
    info!(path = %db_path.display(), "database opened");
    let store = Arc::new(SqliteLog::new(db));

    let relay_cancel = CancellationToken::new();
    let mut relay_tasks = Vec::new();
    let topology = build_topology(&settings.relay, &relay_cancel, &mut relay_tasks).await?;
    let instance_id = settings
        .relay
        .instance_id
        .clone()
        .map(InstanceId::from_raw)
        .unwrap_or_default();

    let server = ChorusServer::new(
        ServerConfig::from_settings(&settings),
        store,
        topology,
        instance_id,
        telemetry.prometheus(),
    );
    let handle = server.listen().await.context("failed to start server")?;
    info!(addr = %handle.addr, "chorus ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");

    let mut tasks = handle.into_tasks();
    tasks.extend(relay_tasks);
    relay_cancel.cancel();
    server
        .shutdown()
        .graceful_shutdown(tasks, Some(SHUTDOWN_TIMEOUT))
        .await;
    Ok(())
}

async fn hub(args: HubArgs) -> Result<()> {
    let settings = load(args.config.as_ref())?;
    let _telemetry = chorus_telemetry::init_telemetry(TelemetryConfig {
        metrics_enabled: false,
        ..telemetry_config(&settings.logging)
    });

    let addr = args.listen.unwrap_or(settings.relay.hub_addr);
    let hub = RelayHub::bind(&addr, settings.relay.max_frame_size)
        .await
        .with_context(|| format!("failed to bind relay hub on {addr}"))?;

    let cancel = CancellationToken::new();
    let running = tokio::spawn(hub.run(cancel.clone()));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down relay hub");
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, running).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Hub(args)) => hub(args).await,
        Some(Command::Serve(args)) => serve(args).await,
        None => serve(ServeArgs::default()).await,
    }
}
