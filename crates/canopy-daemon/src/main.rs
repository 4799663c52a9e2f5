//! `canopyd`: the greenhouse climate controller daemon.
//!
//! Wires the pieces together: persistent state, the MQTT transport, the
//! serial sensor buses and the control loop, then runs until a shutdown
//! signal arrives.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use canopy_control::{Controller, ControllerDeps, HarnessOverrides};
use canopy_core::metrics::SharedSnapshot;
use canopy_devices::{MqttClient, SerialManager};
use canopy_storage::{EventLog, RedbBackend, RedbBackendConfig, StateStore};

use crate::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "canopyd", version, about = "Greenhouse climate controller")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "canopy.yaml")]
    config: PathBuf,

    /// Override the state database path from the config file.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let app = AppConfig::load(&args.config)?;

    let db_path = args
        .db
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| app.storage.path.clone());
    info!(db = %db_path, "opening state database");
    let backend = Arc::new(
        RedbBackend::new(RedbBackendConfig::new(db_path)).context("opening state database")?,
    );
    let store = StateStore::new(backend.clone());
    let events = EventLog::new(backend);

    let snapshot = SharedSnapshot::new(app.avg_window);
    let (fault_tx, faults) = mpsc::channel(32);
    let mqtt = MqttClient::connect(&app.mqtt, snapshot.clone(), fault_tx);
    let sink = Arc::new(mqtt.command_sink());

    let mut serial = SerialManager::new(app.avg_window);
    for bus in &app.buses {
        serial
            .open_and_spawn(bus)
            .with_context(|| format!("opening serial bus '{}'", bus.id))?;
    }

    let deps = ControllerDeps {
        store,
        events,
        snapshot,
        overlay: serial.overlay(),
        harness: HarnessOverrides::new(),
        sink,
        faults,
    };
    let (controller, _handle) = Controller::new(app.controller_settings(), deps)
        .context("building controller")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    controller.run(shutdown_rx).await;

    serial.shutdown();
    mqtt.shutdown();
    info!("canopyd stopped");
    Ok(())
}
