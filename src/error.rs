//! # Error Types
//!
//! Custom error types for DShot Bridge using `thiserror`.

use thiserror::Error;

/// Main error type for DShot Bridge
#[derive(Debug, Error)]
pub enum DshotBridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Motor bus constructed with zero or too many channels
    #[error("Invalid channel count: {0} (must be 1-{max})", max = crate::dshot::protocol::DSHOT_MAX_CHANNELS)]
    InvalidChannelCount(usize),

    /// Host link framing errors
    #[error("Host link protocol error: {0}")]
    LinkProtocol(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// No usable serial device among the candidates
    #[error("No serial device found (tried: {0})")]
    SerialPortNotFound(String),

    /// Telemetry log serialization errors
    #[error("Telemetry log error: {0}")]
    Telemetry(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DShot Bridge
pub type Result<T> = std::result::Result<T, DshotBridgeError>;

/// Classified failure of a single telemetry capture.
///
/// The return channel is lossy by nature: every variant is counted per channel
/// and the capture is dropped. None of them is ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    /// Nothing was captured (raw word is zero)
    #[error("telemetry timeout")]
    Timeout,

    /// A 5-bit group is not a valid GCR codeword
    #[error("invalid GCR codeword")]
    BadGcr,

    /// Telemetry checksum mismatch
    #[error("telemetry checksum mismatch")]
    BadCrc,

    /// Extended telemetry prefix with no known meaning
    #[error("unknown extended telemetry type")]
    BadType,
}
