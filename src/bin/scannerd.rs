//! scannerd - station QR scanner daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Connects the push channel (MQTT)
//! 3. Polls the station registry and runs one capture/decode pipeline per
//!    scannable station until SIGINT/SIGTERM

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use station_scanner::config::ScannerConfig;
use station_scanner::decode::{load_proposer, DecodeChain};
use station_scanner::dispatch::{EventDispatcher, MqttTransport};
use station_scanner::ingest::{RtspConfig, RtspOpener};
use station_scanner::pipeline::ScanPipelineRunner;
use station_scanner::registry::{SqliteRegistry, StaticRegistry, StationRegistry};
use station_scanner::snapshot::SnapshotSink;
use station_scanner::supervisor::FleetSupervisor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "scannerd", version, about = "Station QR scanner daemon")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "SCANNER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ScannerConfig::load_from(args.config.as_deref())?;
    log::info!("scannerd {} starting", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .map_err(|e| anyhow!("error setting signal handler: {}", e))?;
    }

    let mut chain = DecodeChain::standard();
    if let Some(proposer) = load_proposer(
        config.proposer.model_path.as_deref(),
        config.proposer.proposal,
    )? {
        chain = chain.with_proposer(proposer);
    }

    // Separate token: the push channel outlives the pipelines during shutdown.
    let push_cancel = CancellationToken::new();
    let (transport, transport_task) = MqttTransport::spawn(&config.push, push_cancel.clone())?;
    let dispatcher = Arc::new(EventDispatcher::new(transport, &config.push.topic_prefix));

    let opener = Arc::new(RtspOpener::new(RtspConfig {
        target_fps: config.capture.target_fps,
        ..RtspConfig::default()
    }));
    let mut runner = ScanPipelineRunner::new(
        opener,
        Arc::new(chain),
        dispatcher,
        config.capture.clone(),
        config.debounce.clone(),
    );
    let mut snapshot_task = None;
    if config.snapshots.enabled {
        let (sink, task) = SnapshotSink::spawn(&config.snapshots);
        runner = runner.with_snapshots(sink);
        snapshot_task = Some(task);
        log::info!("debug snapshots: {}", config.snapshots.dir.display());
    }

    let registry: Arc<dyn StationRegistry> = match &config.registry.stations {
        Some(stations) => {
            log::info!("registry: {} station(s) from config file", stations.len());
            Arc::new(StaticRegistry::new(stations.clone()))
        }
        None => {
            log::info!("registry: {}", config.registry.db_path);
            Arc::new(SqliteRegistry::open(&config.registry.db_path)?)
        }
    };

    let supervisor = FleetSupervisor::new(
        registry,
        Arc::new(runner),
        config.registry.poll_interval,
    );
    supervisor.run(&cancel).await;

    log::info!("shutdown signal received, stopping pipelines...");
    if !supervisor.shutdown(SHUTDOWN_GRACE).await {
        log::warn!("some pipelines did not stop within {:?}", SHUTDOWN_GRACE);
    }
    // Dropping the supervisor releases the runner and its snapshot sink, which
    // lets the writer drain and exit.
    drop(supervisor);
    if let Some(task) = snapshot_task {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            log::warn!("snapshot writer did not finish in time");
        }
    }
    push_cancel.cancel();
    if let Err(e) = transport_task.await {
        log::warn!("push channel task failed: {}", e);
    }

    log::info!("scannerd stopped");
    Ok(())
}
