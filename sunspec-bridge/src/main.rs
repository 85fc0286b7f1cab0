use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sunspec_bridge::config::{BridgeConfig, Loaded, DEFAULT_CONFIG_PATH};
use sunspec_bridge::encoder::RegisterEncoder;
use sunspec_bridge::layout::entry;
use sunspec_bridge::logging;
use sunspec_bridge::meter::ShellyClient;
use sunspec_bridge::model::ElectricalModel;
use sunspec_bridge::poller::Poller;
use sunspec_bridge::registers::RegisterTable;
use sunspec_bridge::server::ModbusServer;
use sunspec_bridge::snapshot::Phase;

/// Serve a Shelly Pro 3EM as a SunSpec Model 213 meter over Modbus TCP.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file. Created with defaults when missing.
    #[arg(short, long, env = "SUNSPEC_BRIDGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the configured log level (TRACE, DEBUG, INFO, WARNING, ERROR).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match BridgeConfig::load(&cli.config)? {
        Loaded::Config(config) => *config,
        Loaded::DefaultWritten(path) => {
            println!(
                "Wrote a default configuration to {}. Edit it and start again.",
                path.display()
            );
            return Ok(());
        }
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
        config = config.validated()?;
    }
    let _log_guard = logging::init(&config.log_level, config.log_path(&cli.config).as_deref())?;

    let encoder = RegisterEncoder::new(&config.identity);
    banner(&config, &encoder);

    let client = ShellyClient::new(config.shelly_settings()).context("cannot build HTTP client")?;
    let table = RegisterTable::new(encoder.initial_image());
    let mut poller = Poller::new(client, encoder, table.clone(), config.poller_settings());

    match poller.poll_once().await {
        Ok(model) => report(&model),
        Err(err) => warn!(%err, "initial fetch failed; serving zeros until the meter answers"),
    }

    let server = ModbusServer::bind(config.modbus_addr()).await?;

    let shutdown = CancellationToken::new();
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));
    let mut server_task = tokio::spawn(server.serve(table.reader(), shutdown.clone()));

    let served = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server_task => Some(result),
    };
    shutdown.cancel();
    poller_task.await?;
    match served {
        Some(result) => result?.context("modbus server failed")?,
        None => server_task.await??,
    }

    info!("shut down");
    Ok(())
}

fn banner(config: &BridgeConfig, encoder: &RegisterEncoder) {
    info!("{}", "=".repeat(72));
    info!("SunSpec meter bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", "=".repeat(72));
    info!("Shelly meter: {} (em:{})", config.url, config.shelly_em_id);
    info!("Modbus TCP:   {}", config.modbus_addr());
    info!("Consumer workarounds:");
    info!("  - energy counters published as float32 (documented uint32)");
    info!("  - voltage and power fields moved to the addresses read in practice");
    for placement in encoder.layout().placements() {
        let documented = entry(placement.field).addr;
        if placement.addr != documented {
            info!("      {placement} (documented at {documented})");
        } else {
            debug!("      {placement}");
        }
    }
    for shadowed in encoder.layout().shadowed() {
        warn!("  - {shadowed}");
    }
    info!("{}", "=".repeat(72));
}

fn report(model: &ElectricalModel) {
    info!("connected, state: {}", model.direction());
    info!("  total:   {:+8.1} W", model.total.real);
    for phase in Phase::ALL {
        let reading = model.phase(phase);
        info!(
            "  phase {:?}: {:+7.1} W @ {:.1} V",
            phase, reading.power.real, reading.voltage
        );
    }
    info!("  imported: {:>12.0} Wh", model.imported_energy);
    info!("  exported: {:>12.0} Wh", model.exported_energy);
    info!(
        "  net:      {:>12.0} Wh",
        model.imported_energy - model.exported_energy
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(%err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(%err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}
