use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use herald_core::clock::SystemClock;
use herald_dispatch::{MessagingService, ServiceConfig, ServiceDeps};
use herald_server::{BridgeTransportFactory, ServerConfig};
use herald_settings::{parse_level, HeraldSettings};
use herald_store::{Database, InstanceRepo, MessageRepo};
use herald_telemetry::TelemetryConfig;

/// Paced outbound messaging service.
#[derive(Debug, Parser)]
#[command(name = "herald", version)]
struct Cli {
    /// Settings file. Defaults to ~/.herald/settings.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the observer server.
    #[arg(long)]
    port: Option<u16>,

    /// Database file.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn load_settings(cli: &Cli) -> anyhow::Result<HeraldSettings> {
    let path = cli.config.clone().unwrap_or_else(herald_settings::settings_path);
    let mut settings = herald_settings::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(db) = &cli.db {
        settings.database.path = Some(db.display().to_string());
    }
    Ok(settings)
}

fn telemetry_config(settings: &HeraldSettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: parse_level(&logging.level).unwrap_or(tracing::Level::INFO),
        module_levels: logging
            .modules
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect(),
        log_to_sqlite: logging.persist,
        log_db_path: logging.resolved_db_path(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let _telemetry = herald_telemetry::init_telemetry(telemetry_config(&settings));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting herald");

    let db_path = settings.database.resolved_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let bridge = Arc::new(
        BridgeTransportFactory::new(&settings.transport).context("building bridge client")?,
    );
    let service = Arc::new(MessagingService::new(
        ServiceDeps {
            instances: Arc::new(InstanceRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db)),
            transport: bridge.clone(),
            clock: Arc::new(SystemClock),
        },
        ServiceConfig::from_settings(&settings),
    ));
    let restored = service.restore().context("restoring instances")?;
    tracing::info!(restored, bridge_url = %settings.transport.bridge_url, "service ready");

    let poller = if settings.poller.enabled {
        Some(service.start_poller())
    } else {
        tracing::info!("scheduled message poller disabled");
        None
    };

    let server = herald_server::start(
        ServerConfig::from_settings(&settings.server),
        Arc::clone(&service),
        Some(bridge),
    )
    .await
    .context("starting server")?;
    tracing::info!(port = server.port, "herald ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    server.shutdown().await;
    if let Some(poller) = poller {
        poller.stop().await;
    }
    service.shutdown();
    Ok(())
}
