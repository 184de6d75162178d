use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use otad::api::ApiServer;
use otad::client::ServerClient;
use otad::controller::ServerController;
use otad::daemon::{Agent, AgentHandle, Daemon};
use otad::settings::{Settings, SettingsStore};
use otad_updates::FirmwareMetadata;

/// otad - Firmware Update Agent
#[derive(Parser, Debug)]
#[command(name = "otad")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Firmware update agent daemon", long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Directory holding the firmware metadata (firmware.json)
    #[arg(short, long, value_name = "DIR")]
    firmware: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON log output
    #[arg(long)]
    json_logs: bool,

    /// Write a default settings file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.json_logs)?;

    info!("otad v{} starting", env!("CARGO_PKG_VERSION"));

    let settings_path = cli
        .settings
        .unwrap_or_else(|| PathBuf::from("/etc/otad/otad.toml"));
    let firmware_dir = cli
        .firmware
        .unwrap_or_else(|| PathBuf::from("/usr/share/otad"));

    if cli.init {
        let settings = Settings::default();
        settings.save(&settings_path)?;
        info!("settings written to {}", settings_path.display());
        return Ok(());
    }

    let store = SettingsStore::open(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    let settings = store.snapshot();

    let firmware_path = firmware_dir.join("firmware.json");
    let firmware = FirmwareMetadata::from_file(&firmware_path)
        .with_context(|| format!("loading firmware metadata from {}", firmware_path.display()))?;

    info!("product uid: {}", firmware.product_uid);
    info!(
        "hardware: {} (revision {})",
        firmware.hardware, firmware.hardware_revision
    );
    info!("update server: {}", settings.network.server_address);

    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(AgentHandle::new(intent_tx));
    let stop = CancellationToken::new();

    let client = ServerClient::new(&settings.network.server_address)?;
    let progress_handle = handle.clone();
    let controller = ServerController::new(
        client,
        firmware.clone(),
        settings.update.download_dir.clone(),
    )
    .with_progress(Box::new(move |percent| {
        progress_handle.set_progress(percent)
    }));

    let agent = Agent::new(store, firmware, Box::new(controller), handle.clone());
    let daemon = Daemon::new(agent, intent_rx, stop.clone());

    if settings.api.enabled {
        let api_server = ApiServer::new(settings.api.clone(), handle.clone());
        let server_handle = api_server.start().await?;

        tokio::spawn(async move {
            if let Err(e) = server_handle.await {
                error!("API server error: {}", e);
            }
        });
    }

    // A ctrl-c unblocks the current state and stops the loop at the
    // next transition.
    let ctrlc_stop = stop.clone();
    let ctrlc_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            ctrlc_stop.cancel();
            ctrlc_handle.cancel_current();
        }
    });

    let code = daemon.run().await;

    info!("otad shutdown complete");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}
