use anyhow::{Context, Result};
use clap::Parser;
use mitemp_core::sink::{Announcing, JsonLinesSink, LogSink};
use mitemp_core::{
    Decoder, Device, DeviceAddress, DeviceTable, Engine, ReadingSink, ScanConfig, TagMode,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod bluez;

/// Duty-cycled BLE listener for BTHome and Xiaomi temperature/humidity sensors
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Sensor to listen for, as ADDRESS or ADDRESS=ALIAS (repeatable)
    #[arg(long = "device", short = 'd', required = true)]
    devices: Vec<Device>,

    /// Seconds between the starts of two scan windows
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Length of each scan window in milliseconds
    #[arg(long, default_value_t = 5000)]
    scan_window_ms: u64,

    /// Configured sensor to hold a GATT connection to (repeatable)
    #[arg(long = "connect")]
    connect: Vec<DeviceAddress>,

    /// Skip unknown BTHome objects as one byte instead of dropping the frame
    #[arg(long)]
    legacy_tags: bool,

    /// Print readings as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Bluetooth adapter name (defaults to the system default adapter)
    #[arg(long)]
    adapter: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let devices = Arc::new(DeviceTable::new(args.devices));
    let tag_mode = if args.legacy_tags {
        TagMode::Legacy
    } else {
        TagMode::Strict
    };
    let scan = ScanConfig::new(
        Duration::from_secs(args.interval),
        Duration::from_millis(args.scan_window_ms),
    );

    let session = bluer::Session::new().await?;
    let adapter = match &args.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    adapter.set_powered(true).await?;
    info!(
        adapter = adapter.name(),
        devices = devices.len(),
        interval = ?scan.interval,
        window = ?scan.effective_window(),
        ?tag_mode,
        "starting duty-cycled BLE scan"
    );

    let sink: Box<dyn ReadingSink + Send> = if args.json {
        Box::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Box::new(LogSink)
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let mut engine = Engine::new(
        devices.clone(),
        Decoder::new(tag_mode),
        scan,
        Announcing::new(sink),
        command_tx,
    );
    for address in &args.connect {
        if !engine.connect(*address) {
            warn!(%address, "--connect address is not a configured --device");
        }
    }

    let mut host = tokio::spawn(bluez::run(adapter, devices, command_rx, event_tx));
    let engine = engine.spawn(event_rx);

    let host_finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("interrupted, shutting down");
            false
        }
        finished = &mut host => {
            match finished {
                Ok(Ok(())) => warn!("radio task ended"),
                Ok(Err(e)) => error!(error = %e, "radio task failed"),
                Err(e) => error!(error = %e, "radio task panicked"),
            }
            true
        }
    };

    engine.stop().await.context("engine task")?;
    // lets the engine's final close/release commands reach BlueZ
    if !host_finished && tokio::time::timeout(Duration::from_secs(3), &mut host).await.is_err() {
        warn!("radio task did not finish in time");
        host.abort();
    }
    Ok(())
}
