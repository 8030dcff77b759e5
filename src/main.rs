//! RustCadence - BLE Crank Cadence Monitor
//!
//! Connects to a cadence sensor (or a simulated one) and prints every
//! connection state change and cadence reading until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use rustcadence::sensors::ble::BleTransport;
use rustcadence::sensors::manager::{ConnectionManager, SessionConfig};
use rustcadence::sensors::simulated::SimulatedTransport;
use rustcadence::sensors::transport::SensorTransport;
use rustcadence::storage::config::{load_config, load_config_from};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RustCadence - live crank cadence from a Bluetooth CSC sensor
#[derive(Parser, Debug)]
#[command(name = "rustcadence")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use a simulated sensor instead of Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Cadence of the simulated sensor (overrides the config file)
    #[arg(long, value_name = "RPM")]
    rpm: Option<f64>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    tracing::info!("Starting RustCadence v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config().context("Failed to load config")?,
    };
    if let Some(rpm) = args.rpm {
        config.simulation.target_rpm = rpm;
    }

    let session = config.session_config();

    if args.simulate {
        let sim = &config.simulation;
        let transport = SimulatedTransport::new(sim.target_rpm, sim.interval(), sim.drop_after);
        run_session(transport, session).await
    } else {
        let transport = BleTransport::new(config.sensors.scan_timeout())
            .await
            .context("Bluetooth is not available")?;
        run_session(transport, session).await
    }
}

/// Drive one session until Ctrl-C or the session task ends.
async fn run_session<T: SensorTransport>(transport: T, config: SessionConfig) -> Result<()> {
    let manager = ConnectionManager::spawn(transport, config);
    let mut updates = manager.subscribe();

    manager.connect()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => println!("{:<16} {}", update.state.to_string(), update.cadence_text()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Display fell behind, skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
