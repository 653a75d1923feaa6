use clap::Parser;
use neuroband_bridge::{Bridge, BridgeConfig};
use neuroband_types::{BridgeError, BridgeResult};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "neuroband-bridge",
    version,
    about = "Supervises the Neuroband signal backend and its telemetry stream"
)]
struct Cli {
    /// Path to the bridge config; defaults to the per-user config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the backend executable from the config
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    write_config: bool,
}

fn init_logging(cli: &Cli, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(BridgeConfig::default_path);
    let mut config = BridgeConfig::load_or_default(&config_path)?;
    if let Some(backend) = cli.backend.clone() {
        config.backend.executable = Some(backend);
    }
    config.validate()?;

    init_logging(&cli, config.logging.json);

    if cli.write_config {
        config.save(&config_path)?;
        info!("Wrote config to {}", config_path.display());
        return Ok(());
    }

    let bridge = Bridge::new(config)?;
    bridge.start().await?;
    info!("Bridge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BridgeError::Internal(format!("Failed to wait for Ctrl-C: {}", e)))?;

    bridge.shutdown().await?;
    Ok(())
}
