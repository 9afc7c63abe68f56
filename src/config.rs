//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::bus::min_command_repeat;
use crate::dshot::protocol::{Command, DshotSpeed, DSHOT_MAX_CHANNELS};
use crate::error::{DshotBridgeError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub serial: SerialConfig,
    pub dshot: DshotConfig,
    pub safety: SafetyConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path, or "auto" to probe the usual USB serial devices
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Motor bus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DshotConfig {
    #[serde(default = "default_speed")]
    pub speed: DshotSpeed,

    /// Channel count of each bus; motors are numbered across buses in order
    #[serde(default = "default_groups")]
    pub groups: Vec<usize>,

    #[serde(default = "default_rx_timeout_us")]
    pub rx_timeout_us: u64,

    #[serde(default = "default_loop_rate_hz")]
    pub loop_rate_hz: u32,
}

/// Failsafe and link supervision configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SafetyConfig {
    /// Bus idle window before all channels are forced to neutral
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Host silence after which host throttles fall back to neutral
    #[serde(default = "default_comm_timeout_ms")]
    pub comm_timeout_ms: u64,

    /// Telemetry silence after which a motor's EDT is considered off
    #[serde(default = "default_edt_timeout_ms")]
    pub edt_timeout_ms: u64,
}

/// One command sent to every motor at startup
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct StartupCommand {
    pub command: Command,
    pub repeat: u8,
}

/// Startup sequence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    #[serde(default = "default_startup_commands")]
    pub commands: Vec<StartupCommand>,
}

/// Telemetry log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,

    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; console only when unset
    #[serde(default)]
    pub file_dir: Option<String>,
}

// Default value functions
fn default_serial_port() -> String { "auto".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_timeout_ms() -> u64 { 100 }

fn default_speed() -> DshotSpeed { DshotSpeed::DShot300 }
fn default_groups() -> Vec<usize> { vec![4, 4] }
fn default_rx_timeout_us() -> u64 { 500 }
fn default_loop_rate_hz() -> u32 { 1000 }

fn default_idle_timeout_ms() -> u64 { 500 }
fn default_comm_timeout_ms() -> u64 { 200 }
fn default_edt_timeout_ms() -> u64 { 1000 }

fn default_startup_commands() -> Vec<StartupCommand> {
    vec![
        StartupCommand { command: Command::ThreeDModeOn, repeat: 10 },
        // Outlasts the 35 ms save delay on a single-channel bus at 1 kHz
        StartupCommand { command: Command::SaveSettings, repeat: 40 },
    ]
}

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }
fn default_log_format() -> String { "jsonl".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for StartupConfig {
    fn default() -> Self {
        Self { commands: default_startup_commands() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file_dir: None }
    }
}

impl SafetyConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    pub fn edt_timeout(&self) -> Duration {
        Duration::from_millis(self.edt_timeout_ms)
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            comm_timeout_ms: default_comm_timeout_ms(),
            edt_timeout_ms: default_edt_timeout_ms(),
        }
    }
}

impl DshotConfig {
    pub fn rx_timeout(&self) -> Duration {
        Duration::from_micros(self.rx_timeout_us)
    }

    /// Control loop period
    pub fn loop_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_rate_hz.max(1) as u64)
    }

    /// Total motors across every bus
    pub fn total_motors(&self) -> usize {
        self.groups.iter().sum()
    }
}

fn invalid(msg: impl std::fmt::Display) -> DshotBridgeError {
    DshotBridgeError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dshot_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if self.serial.timeout_ms == 0 || self.serial.timeout_ms > 10000 {
            return Err(invalid("timeout_ms must be between 1 and 10000"));
        }

        if ![9600, 57600, 115200, 230400, 460800, 921600].contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        if self.dshot.groups.is_empty() {
            return Err(invalid("at least one motor group is required"));
        }

        for (i, &channels) in self.dshot.groups.iter().enumerate() {
            if channels == 0 || channels > DSHOT_MAX_CHANNELS {
                return Err(invalid(format!(
                    "group {} has {} channels (must be 1-{})",
                    i, channels, DSHOT_MAX_CHANNELS
                )));
            }
        }

        // Motor ids travel as one byte on the host link
        if self.dshot.total_motors() > u8::MAX as usize + 1 {
            return Err(invalid("too many motors for the host link (max 256)"));
        }

        if self.dshot.rx_timeout_us == 0 || self.dshot.rx_timeout_us > 100_000 {
            return Err(invalid("rx_timeout_us must be between 1 and 100000"));
        }

        if self.dshot.loop_rate_hz == 0 || self.dshot.loop_rate_hz > 10_000 {
            return Err(invalid("loop_rate_hz must be between 1 and 10000"));
        }

        if self.safety.idle_timeout_ms == 0 || self.safety.idle_timeout_ms > 60000 {
            return Err(invalid("idle_timeout_ms must be between 1 and 60000"));
        }

        if self.safety.comm_timeout_ms == 0 || self.safety.comm_timeout_ms > 60000 {
            return Err(invalid("comm_timeout_ms must be between 1 and 60000"));
        }

        if self.safety.edt_timeout_ms == 0 || self.safety.edt_timeout_ms > 60000 {
            return Err(invalid("edt_timeout_ms must be between 1 and 60000"));
        }

        // The smallest bus visits each channel most often during a delay
        let min_group = self.dshot.groups.iter().copied().min().unwrap_or(1);
        for startup in &self.startup.commands {
            if startup.repeat < 2 {
                return Err(invalid(format!(
                    "startup command {:?} needs repeat of at least 2 to be sent",
                    startup.command
                )));
            }

            let needed = min_command_repeat(
                startup.command.value(),
                min_group,
                self.dshot.loop_period(),
            );
            if u32::from(startup.repeat) < needed {
                return Err(invalid(format!(
                    "startup command {:?} needs repeat of at least {} to outlast its delay on a {}-channel group",
                    startup.command, needed, min_group
                )));
            }
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.telemetry.format != "jsonl" {
            return Err(invalid("log format must be 'jsonl' (only supported format)"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
