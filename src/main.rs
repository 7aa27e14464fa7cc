//! CLI Entry Point for the DI-245 driver
//!
//! Provides command-line access to:
//! - Device identification (`info`)
//! - Continuous acquisition with periodic status reports (`acquire`)
//! - Burst rate calculation (`rate`)
//! - The effective configuration (`show-config`)
//!
//! # Usage
//!
//! ```bash
//! di245 info --port /dev/ttyUSB0
//! di245 acquire --simulate --duration 10
//! di245 rate --hz 25
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use di245_daq::config::{DaqConfig, DEFAULT_CONFIG_PATH};
use di245_daq::hardware::{self, MockPort, PortIo};
use di245_daq::protocol::RateConfig;
use di245_daq::{logging, AcquisitionController, AcquisitionStatus, RingBuffer};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "di245")]
#[command(about = "DATAQ DI-245 serial acquisition driver", long_about = None, version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override application.log_level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the device descriptor
    Info {
        /// Serial port (overrides serial.port)
        #[arg(long)]
        port: Option<String>,

        /// Use the built-in device simulator
        #[arg(long)]
        simulate: bool,
    },

    /// Configure the device and acquire until Ctrl-C or the duration elapses
    Acquire {
        /// Serial port (overrides serial.port)
        #[arg(long)]
        port: Option<String>,

        /// Use the built-in device simulator
        #[arg(long)]
        simulate: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Status report interval in milliseconds
        #[arg(long, default_value = "1000")]
        report_ms: u64,
    },

    /// Compute rate divisors and the xrate frame
    Rate {
        /// Target burst rate in Hz
        #[arg(long, conflicts_with_all = ["sf", "af"])]
        hz: Option<f64>,

        /// Sampling divisor SF
        #[arg(long, requires = "af")]
        sf: Option<u8>,

        /// Averaging divisor AF
        #[arg(long, requires = "sf")]
        af: Option<u8>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    logging::init_from_config(&config).context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Info { port, simulate } => show_info(&config, port, simulate).await,
        Commands::Acquire {
            port,
            simulate,
            duration,
            report_ms,
        } => acquire(&config, port, simulate, duration, report_ms).await,
        Commands::Rate { hz, sf, af } => show_rate(hz, sf, af),
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn open_device(config: &DaqConfig, port: Option<String>, simulate: bool) -> Result<Box<dyn PortIo>> {
    if simulate {
        info!("Using simulated DI-245");
        return Ok(Box::new(MockPort::simulator()));
    }
    let path = port
        .or_else(|| config.serial.port.clone())
        .context("No serial port given (use --port or set serial.port)")?;
    let device = hardware::open_port(&path).with_context(|| format!("Failed to open {path}"))?;
    Ok(device)
}

async fn show_info(config: &DaqConfig, port: Option<String>, simulate: bool) -> Result<()> {
    let device = open_device(config, port, simulate)?;
    let mut daq = AcquisitionController::new(device, config.settings());
    let descriptor = daq.initialize().await.context("Device did not identify")?;

    println!("Device:           DI-{}", descriptor.name);
    println!("Firmware:         {}", descriptor.firmware_version);
    println!("Calibration date: {}", descriptor.calibration_date);
    println!("Serial number:    {}", descriptor.serial_number);
    Ok(())
}

async fn acquire(
    config: &DaqConfig,
    port: Option<String>,
    simulate: bool,
    duration: Option<u64>,
    report_ms: u64,
) -> Result<()> {
    let device = open_device(config, port, simulate)?;
    let mut daq = AcquisitionController::new(device, config.settings());

    let descriptor = daq.initialize().await.context("Device did not identify")?;
    println!("Connected to {descriptor}");

    let channels = config.channel_configs()?;
    let rate = config.rate_config()?;
    let report = daq
        .configure(channels, rate)
        .await
        .context("Failed to configure device")?;
    if !report.all_ok() {
        warn!(
            "Only {:.0}% of channel commands were confirmed",
            report.success_ratio() * 100.0
        );
    }
    println!("Rate: {rate}");

    daq.start().await.context("Failed to start acquisition")?;
    let buffer = daq.buffer().context("No ring buffer after configuration")?;

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(report_ms.max(1)));
    let mut fault = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping acquisition");
                break;
            }
            _ = ticker.tick() => {
                let status = daq.status();
                print_status(&status, &buffer);
                if status.fault.is_some() {
                    fault = status.fault;
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
        }
    }

    daq.stop().await.context("Failed to stop acquisition")?;
    println!(
        "Stopped: {} scans stored, {} acquired in total",
        buffer.len(),
        buffer.total_appended()
    );

    if let Some(fault) = fault {
        bail!("Acquisition ended with a fault: {fault}");
    }
    Ok(())
}

fn print_status(status: &AcquisitionStatus, buffer: &RingBuffer) {
    let latest = buffer
        .latest()
        .map(|frame| format!("{:?}", frame.centered()))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "blocks={} scans={} zero-filled={} dropped={} resyncs={} latest={}",
        status.blocks_decoded,
        status.frames_appended,
        status.decode_errors,
        status.blocks_dropped,
        status.resyncs,
        latest
    );
}

fn show_rate(hz: Option<f64>, sf: Option<u8>, af: Option<u8>) -> Result<()> {
    let rate = match (hz, sf, af) {
        (Some(hz), _, _) => RateConfig::nearest(hz)?,
        (None, Some(sf), Some(af)) => RateConfig::from_divisors(sf, af),
        _ => bail!("Give either --hz or both --sf and --af"),
    };
    println!("{rate}");
    println!("{}", rate.encode());
    Ok(())
}
