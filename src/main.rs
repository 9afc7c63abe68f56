//! # DShot Bridge
//!
//! Drives multiplexed DShot motor buses from host throttle packets and sends
//! ESC telemetry back to the host.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use dshot_bridge::bridge::{Bridge, MotorTelemetry};
use dshot_bridge::bus::sim::SimulatedEsc;
use dshot_bridge::bus::{Clock, MonotonicClock, MotorBus, ProgramRegistry, TransportPort};
use dshot_bridge::config::{Config, LoggingConfig};
use dshot_bridge::link::encoder::encode_telemetry_packet;
use dshot_bridge::serial::{HostSerial, TelemetryWriter};
use dshot_bridge::telemetry::logger::JsonlLogger;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Ticks between status log messages
const LOG_INTERVAL_TICKS: u64 = 5000;

/// Log file name prefix for daily-rolling diagnostics
const LOG_FILE_PREFIX: &str = "dshot-bridge.log";

/// Command line: `dshot-bridge [CONFIG] [--headless]`
#[derive(Debug, PartialEq, Eq)]
struct Args {
    config_path: String,
    headless: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Args {
    let mut parsed = Args {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
        headless: false,
    };

    for arg in args {
        if arg == "--headless" {
            parsed.headless = true;
        } else if !arg.starts_with("--") {
            parsed.config_path = arg;
        }
    }

    parsed
}

/// Console logging, plus daily-rolling files when `file_dir` is set.
/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

/// One bus per configured group, all sharing a program registry
fn build_buses<C: Clock + Copy>(
    config: &Config,
    clock: C,
) -> Result<Vec<MotorBus<SimulatedEsc, C>>> {
    let registry = ProgramRegistry::new();

    config
        .dshot
        .groups
        .iter()
        .map(|&channels| -> Result<MotorBus<SimulatedEsc, C>> {
            let bus = MotorBus::new(
                channels,
                config.dshot.speed,
                SimulatedEsc::new(channels),
                clock,
                &registry,
            )?
            .with_idle_timeout(config.safety.idle_timeout())
            .with_rx_timeout(config.dshot.rx_timeout());
            Ok(bus)
        })
        .collect()
}

/// Open the host port and start a task feeding its throttle packets into `tx`
fn start_host_link(
    config: &Config,
    num_motors: usize,
    tx: mpsc::UnboundedSender<Vec<u16>>,
) -> Option<TelemetryWriter> {
    let serial = match HostSerial::open(&config.serial.port, config.serial.baud_rate) {
        Ok(serial) => serial,
        Err(e) => {
            warn!("{}; running headless", e);
            return None;
        }
    };
    info!("Host serial port opened at: {}", serial.device_path());

    let (mut reader, writer) = serial.split(num_motors);
    tokio::spawn(async move {
        loop {
            match reader.next_throttles().await {
                Ok(Some(values)) => {
                    if tx.send(values).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    warn!("Host serial port closed");
                    break;
                }
                Err(e) => {
                    error!("Host link failed: {}", e);
                    break;
                }
            }
        }
    });

    Some(writer)
}

async fn forward_telemetry(
    event: MotorTelemetry,
    writer: &mut Option<TelemetryWriter>,
    logger: &mut Option<JsonlLogger>,
    write_timeout: Duration,
) {
    if let Some(logger) = logger.as_mut() {
        if let Err(e) = logger.log(event.motor, event.kind, event.value) {
            warn!("Failed to log telemetry: {}", e);
        }
    }

    let Some(writer) = writer.as_mut() else {
        return;
    };
    let Ok(motor) = u8::try_from(event.motor) else {
        return;
    };
    let Some(packet) = encode_telemetry_packet(motor, event.kind, event.value) else {
        return;
    };

    match timeout(write_timeout, writer.send_packet(&packet)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to send telemetry: {}", e),
        Err(_) => debug!("Telemetry write timed out"),
    }
}

fn log_status<T: TransportPort, C: Clock>(bridge: &Bridge<T, C>, ticks: u64) {
    let (mut tx, mut rx, mut errors) = (0u64, 0u64, 0u64);
    for motor in 0..bridge.num_motors() {
        if let Some(stats) = bridge.stats(motor) {
            tx += stats.tx_frames as u64;
            rx += stats.rx_frames as u64;
            errors += stats.rx_errors() as u64;
        }
    }
    info!(
        "{} ticks: {} frames sent, {} telemetry frames, {} receive errors{}",
        ticks,
        tx,
        rx,
        errors,
        if bridge.link_lost() { " (host link lost)" } else { "" }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1));
    let config = Config::load(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {}", args.config_path))?;

    let _log_guard = init_logging(&config.logging);
    info!("DShot Bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let clock = MonotonicClock;
    let buses = build_buses(&config, clock)?;
    let mut bridge = Bridge::new(buses, clock, &config.safety)
        .with_loop_period(config.dshot.loop_period());
    bridge.queue_startup(&config.startup.commands);

    let (throttle_tx, mut throttle_rx) = mpsc::unbounded_channel();
    let mut writer = if args.headless {
        info!("Running headless, host throttles stay at neutral");
        None
    } else {
        start_host_link(&config, bridge.num_motors(), throttle_tx)
    };

    let mut logger = if config.telemetry.enabled {
        Some(JsonlLogger::new(
            &config.telemetry.log_dir,
            config.telemetry.max_records_per_file,
            config.telemetry.max_files_to_keep,
        )?)
    } else {
        None
    };

    let write_timeout = Duration::from_millis(config.serial.timeout_ms);
    let mut ticker = interval(config.dshot.loop_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Driving {} motors at {} Hz ({:?})",
        bridge.num_motors(),
        config.dshot.loop_rate_hz,
        config.dshot.speed
    );
    info!("Press Ctrl+C to exit");

    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(values) = throttle_rx.try_recv() {
                    if let Err(e) = bridge.set_host_throttles(&values) {
                        warn!("{}", e);
                    }
                }

                for event in bridge.tick() {
                    forward_telemetry(event, &mut writer, &mut logger, write_timeout).await;
                }

                ticks += 1;
                if ticks % LOG_INTERVAL_TICKS == 0 {
                    log_status(&bridge, ticks);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    log_status(&bridge, ticks);
    if let Some(logger) = logger.as_mut() {
        logger.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Args {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_default_args() {
        assert_eq!(
            args(&[]),
            Args { config_path: DEFAULT_CONFIG_PATH.to_string(), headless: false }
        );
    }

    #[test]
    fn test_config_path_and_headless() {
        assert_eq!(
            args(&["--headless", "bench.toml"]),
            Args { config_path: "bench.toml".to_string(), headless: true }
        );
    }

    #[test]
    fn test_unknown_flags_ignored() {
        assert_eq!(args(&["--verbose"]).config_path, DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn test_default_config_file_is_valid() {
        let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();
        assert_eq!(config.dshot.total_motors(), 8);
    }

    #[test]
    fn test_build_buses_per_group() {
        let config = Config::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();
        let buses = build_buses(&config, MonotonicClock).unwrap();
        assert_eq!(buses.len(), 2);
        assert!(buses.iter().all(|b| b.num_channels() == 4));
    }
}
