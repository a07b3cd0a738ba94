use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use qpmu_rs::estimator::Estimator;
use qpmu_rs::processor::{DataProcessor, PhasorServerSupervisor};
use qpmu_rs::server::PmuIdentity;
use qpmu_rs::settings::{JsonFileStore, SettingsStore, DEFAULT_NETWORK_SOCKET};
use qpmu_rs::source::{DeviceSource, SampleSource, StdinSource, WireFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Nominal sampling rate and fundamental frequency the estimator is built for.
const DEFAULT_FS: u32 = 1200;
const DEFAULT_F0: u32 = 50;

#[derive(Parser, Debug)]
#[command(name = "qpmu", about = "Real-time phasor measurement unit engine")]
struct Args {
    /// Input samples are raw binary `Sample` records (otherwise CSV).
    #[arg(long)]
    binary: bool,

    /// Read from the character device named by the ADC_STREAM environment
    /// variable instead of stdin.
    #[arg(long)]
    rpmsg: bool,

    /// Path to the settings JSON file.
    #[arg(long, default_value = "pmu-settings.json")]
    settings: String,
}

fn build_source(args: &Args) -> Result<Box<dyn SampleSource>> {
    let format = if args.binary { WireFormat::Binary } else { WireFormat::Csv };

    if args.rpmsg {
        let device_path = std::env::var("ADC_STREAM")
            .context("--rpmsg requires the ADC_STREAM environment variable")?;
        let source = DeviceSource::open(&device_path)
            .with_context(|| format!("failed to open ADC device {device_path}"))?;
        info!("reading samples from RPMsg device {device_path}");
        return Ok(Box::new(source));
    }

    info!("reading samples from stdin ({} mode)", if args.binary { "binary" } else { "CSV" });
    Ok(Box::new(StdinSource::new(format)))
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .format_target(false)
        .format_level(false)
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let store: Box<dyn SettingsStore> = Box::new(JsonFileStore::open(&args.settings));
    let network_socket = store
        .get_string("network/socket")?
        .unwrap_or_else(|| DEFAULT_NETWORK_SOCKET.to_string());
    let listen_addr = parse_listen_addr(&network_socket);

    let source = build_source(&args)?;
    let estimator = Estimator::new(DEFAULT_FS, DEFAULT_F0)
        .context("failed to construct the phasor estimator")?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let mut processor = DataProcessor::new(source, estimator, keep_running.clone());
    let handle = processor.handle();

    let supervisor = Arc::new(Mutex::new(PhasorServerSupervisor::spawn(
        listen_addr,
        PmuIdentity::default_identity(),
        handle,
    )));
    {
        let supervisor = supervisor.clone();
        let keep_running = keep_running.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            keep_running.store(false, Ordering::SeqCst);
            supervisor.lock().unwrap().stop_current();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    info!("acquisition loop starting");
    if let Err(e) = processor.run() {
        error!("acquisition loop exited with error: {e}");
    }

    supervisor.lock().unwrap().stop_current();
    info!("shutdown complete");
    Ok(())
}

/// Parses the `"tcp:HOST:PORT"` / `"udp:HOST:PORT"` settings value into a
/// bindable `host:port` string. UDP publication is not implemented by the
/// server (TCP-only); any `udp:` prefix falls back to the host/port pair
/// for the TCP listener.
fn parse_listen_addr(socket_setting: &str) -> String {
    socket_setting
        .strip_prefix("tcp:")
        .or_else(|| socket_setting.strip_prefix("udp:"))
        .unwrap_or(socket_setting)
        .to_string()
}
