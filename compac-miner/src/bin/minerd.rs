//! Burn-in daemon for one BM1397 chain.
//!
//! Drives the chain on the configured serial port with synthetic work and
//! logs a telemetry snapshot every 30 seconds.
//!
//! Environment:
//!   COMPAC_CONFIG  path to a JSON driver config (defaults apply otherwise)
//!   COMPAC_PORT    serial port, overriding the config

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task;
use tokio_util::sync::CancellationToken;

use compac_miner::config::DriverConfig;
use compac_miner::device::Device;
use compac_miner::driver::Driver;
use compac_miner::error::Error;
use compac_miner::registry::PortRegistry;
use compac_miner::tracing::{init_journald_or_stdout, prelude::*};
use compac_miner::transport::SerialTransport;
use compac_miner::work::BurnInSource;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
const REOPEN_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    init_journald_or_stdout();

    let config = load_config()?;
    info!(port = %config.port, ident = ?config.ident, "Starting compac-minerd");

    let running = CancellationToken::new();
    tokio::spawn({
        let running = running.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown requested");
            running.cancel();
        }
    });

    let registry = Arc::new(PortRegistry::new());
    let source = Arc::new(BurnInSource::new(!config.noboost));

    while !running.is_cancelled() {
        let transport = SerialTransport::open(&config.port)
            .with_context(|| format!("failed to open {}", config.port))?;
        let device = Arc::new(Device::new(
            &config,
            Arc::new(transport),
            source.clone(),
            registry.clone(),
        ));
        let driver = Driver::start(device.clone())?;

        match supervise(driver, &device, &running).await {
            Ok(()) => break,
            Err(Error::ReopenRequested(port)) => {
                warn!(port, "Reopening port");
                tokio::time::sleep(REOPEN_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        accepted = source.accepted(),
        hashes = source.hashes(),
        "compac-minerd stopped"
    );
    Ok(())
}

fn load_config() -> Result<DriverConfig> {
    let mut config = match env::var("COMPAC_CONFIG") {
        Ok(path) => {
            DriverConfig::from_file(&path).with_context(|| format!("failed to load {path}"))?
        }
        Err(_) => DriverConfig::default(),
    };
    if let Ok(port) = env::var("COMPAC_PORT") {
        config.port = port;
    }
    Ok(config.normalized())
}

/// Runs until ctrl-c or until the device stops on its own.
async fn supervise(
    driver: Driver,
    device: &Arc<Device>,
    running: &CancellationToken,
) -> compac_miner::error::Result<()> {
    let mut telemetry = tokio::time::interval(TELEMETRY_INTERVAL);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    // Both fire immediately; skip the empty first snapshot.
    telemetry.tick().await;

    loop {
        tokio::select! {
            _ = running.cancelled() => {
                return join(move || driver.shutdown()).await;
            }
            _ = liveness.tick() => {
                if !driver.is_running() {
                    return join(move || driver.wait()).await;
                }
            }
            _ = telemetry.tick() => log_telemetry(device),
        }
    }
}

/// Driver joins block on OS threads, so they run off the runtime.
async fn join<F>(f: F) -> compac_miner::error::Result<()>
where
    F: FnOnce() -> compac_miner::error::Result<()> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .unwrap_or(Err(Error::ThreadPanicked("driver join")))
}

fn log_telemetry(device: &Device) {
    match serde_json::to_string(&device.telemetry()) {
        Ok(json) => info!(port = device.port(), telemetry = %json, "Telemetry"),
        Err(e) => warn!(port = device.port(), error = %e, "Failed to serialize telemetry"),
    }
}
