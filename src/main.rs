use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use pulseox_rs::bridge::{ByteSource, SerialBridge};
use pulseox_rs::parse::spawn_frame_parser;
use pulseox_rs::prelude::*;
use pulseox_rs::protocol::DEFAULT_SERIAL_STARTUP_DELAY;
use pulseox_rs::session::forward_readings;

/// Stream pulse-oximeter readings from a BLE transparent-UART device (or a
/// serial port) to stdout.
#[derive(Debug, Parser)]
#[command(name = "pulseox", version, about)]
struct Args {
    /// MAC address of the oximeter, e.g. `00:A0:50:C8:E7:31`.
    #[arg(
        long,
        env = "PULSEOX_ADDRESS",
        required_unless_present = "serial",
        value_parser = parse_address
    )]
    address: Option<String>,

    /// How long one discovery pass may run.
    #[arg(long, default_value_t = 2000)]
    scan_deadline_ms: u64,

    /// Drop the link when no frame arrives for this long.
    #[arg(long, default_value_t = 2000)]
    inactivity_ms: u64,

    /// Notification ring-buffer size in bytes.
    #[arg(long, default_value_t = 1024)]
    buffer: usize,

    /// Output line format.
    #[arg(long, value_enum, default_value_t = Format::Raw)]
    format: Format,

    /// Retry adapter failures forever instead of exiting.
    #[arg(long)]
    unattended: bool,

    /// Wait this long before touching the adapter or serial port.
    /// Default: 0 for BLE, 3000 for `--serial`.
    #[arg(long)]
    startup_delay_ms: Option<u64>,

    /// Use the built-in oximeter simulator (no hardware needed).
    #[arg(long, conflicts_with = "serial")]
    simulate: bool,

    /// Read frames from a serial device or file instead of BLE.
    #[arg(long, value_name = "PATH")]
    serial: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// `ts,device,b0,b1,b2,b3,b4`
    Raw,
    /// Decoded fields with a header line.
    Csv,
    /// One JSON object per line.
    Json,
}

fn parse_address(s: &str) -> Result<String, String> {
    let address = s.trim();
    if address.is_empty() {
        return Err("the device address must not be empty".into());
    }
    Ok(address.to_owned())
}

fn make_sink(format: Format) -> Box<dyn ReadingSink> {
    match format {
        Format::Raw => Box::new(RawSink::new(io::stdout())),
        Format::Csv => Box::new(CsvSink::new(io::stdout())),
        Format::Json => Box::new(JsonSink::new(io::stdout())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Logs go to stderr; stdout carries readings only.  Set RUST_LOG=debug for
    // verbose output, e.g.:
    //   RUST_LOG=pulseox_rs=debug pulseox --simulate --address 00:A0:50:C8:E7:31
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!("cannot listen for Ctrl-C: {e}"),
            }
        });
    }

    let sink = make_sink(args.format);
    let startup_delay = args.startup_delay_ms.map(Duration::from_millis);

    if let Some(path) = &args.serial {
        let delay = startup_delay.unwrap_or(DEFAULT_SERIAL_STARTUP_DELAY);
        return run_serial(path, sink, delay, &cancel).await;
    }
    let startup_delay = startup_delay.unwrap_or(Duration::ZERO);
    let address = args.address.clone().context("--address is required")?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = SupervisorConfig {
        target_address: address.clone(),
        scan_deadline: Duration::from_millis(args.scan_deadline_ms),
        inactivity_timeout: Duration::from_millis(args.inactivity_ms),
        ring_capacity: args.buffer.max(1),
        adapter_policy: if args.unattended {
            AdapterPolicy::Retry
        } else {
            AdapterPolicy::Fatal
        },
        ..SupervisorConfig::default()
    };

    if !startup_delay.is_zero() {
        info!("waiting {startup_delay:?} before starting");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(startup_delay) => {}
        }
    }

    if args.simulate {
        info!("using the built-in oximeter simulator");
        let central = SimulatedCentral::new(SimConfig {
            target_address: address,
            ..SimConfig::default()
        });
        run_ble(Arc::new(central), sink, config, cancel).await
    } else {
        run_ble(Arc::new(BtleplugCentral::new()), sink, config, cancel).await
    }
}

async fn run_ble<C: BleCentral>(
    central: Arc<C>,
    sink: Box<dyn ReadingSink>,
    config: SupervisorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut supervisor = Supervisor::new(central, sink, config);
    supervisor.run(cancel).await.context("supervisor failed")?;
    Ok(())
}

/// Stream from a wired adapter until cancelled, reopening `path` whenever it
/// reaches EOF or cannot be opened.
async fn run_serial(
    path: &Path,
    mut sink: Box<dyn ReadingSink>,
    startup_delay: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let backoff = SupervisorConfig::default().session_backoff;
    let device_id = path.display().to_string();
    let mut delay = startup_delay;
    let mut readings: u64 = 0;

    while !cancel.is_cancelled() {
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                info!("serial: reading {device_id}");
                let bridge = Arc::new(SerialBridge::new(file, delay, 256));
                delay = Duration::ZERO;
                let parser = cancel.child_token();
                let mut frames = spawn_frame_parser(
                    Arc::clone(&bridge) as Arc<dyn ByteSource>,
                    device_id.clone(),
                    parser.clone(),
                );
                let ended = forward_readings(&mut frames, &mut sink, None, cancel, || {
                    readings += 1
                })
                .await;
                parser.cancel();
                bridge.close();
                let ended = ended.context("writing readings")?;
                info!("serial: {device_id} ended ({ended:?}), {readings} reading(s) so far");
            }
            Err(e) => warn!("serial: cannot open {device_id}: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn ble_mode_needs_an_address() {
        std::env::remove_var("PULSEOX_ADDRESS");
        assert!(Args::try_parse_from(["pulseox"]).is_err());
        assert!(Args::try_parse_from(["pulseox", "--simulate"]).is_err());
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!(Args::try_parse_from(["pulseox", "--address", ""]).is_err());
        assert!(Args::try_parse_from(["pulseox", "--address", "  "]).is_err());
    }

    #[test]
    fn address_is_trimmed() {
        let args = Args::try_parse_from(["pulseox", "--address", " 00:A0:50:C8:E7:31 "]).unwrap();
        assert_eq!(args.address.as_deref(), Some("00:A0:50:C8:E7:31"));
        assert_eq!(args.format, Format::Raw);
    }

    #[test]
    fn serial_mode_needs_no_address() {
        let args = Args::try_parse_from(["pulseox", "--serial", "/dev/ttyUSB0"]).unwrap();
        assert_eq!(args.serial, Some(PathBuf::from("/dev/ttyUSB0")));
        assert!(args.startup_delay_ms.is_none());
    }
}
