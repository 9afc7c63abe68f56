//! # Serial Communication Module
//!
//! Handles the serial link to the host computer.
//!
//! This module handles:
//! - Opening the host USB serial port
//! - Reading throttle packets from the host
//! - Writing telemetry packets to the host

pub mod port_trait;

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{DshotBridgeError, Result};
use crate::link::decoder::InputParser;
use port_trait::{AsyncPort, SerialPortIO};

/// Default host device paths to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyACM0", // USB CDC devices
    "/dev/ttyUSB0", // USB-to-serial adapters
];

const READ_CHUNK: usize = 64;

/// Open connection to the host
pub struct HostSerial {
    port: SerialStream,
    device_path: String,
}

impl std::fmt::Debug for HostSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl HostSerial {
    /// Open the host port
    ///
    /// `"auto"` tries [`DEFAULT_DEVICE_PATHS`] in order, anything else is
    /// opened as given.
    ///
    /// # Errors
    ///
    /// Returns error if no device could be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dshot_bridge::serial::HostSerial;
    ///
    /// let serial = HostSerial::open("auto", 115200)?;
    /// println!("Connected to: {}", serial.device_path());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        if port == "auto" {
            Self::open_with_paths(DEFAULT_DEVICE_PATHS, baud_rate)
        } else {
            Self::open_with_paths(&[port], baud_rate)
        }
    }

    /// Open the first of `paths` that succeeds
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened host serial port at {} ({} baud)", path, baud_rate);
                    return Ok(Self {
                        port,
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(DshotBridgeError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port, 8N1 without flow control
    fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DshotBridgeError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Get the device path of the opened serial port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Split into a throttle reader for `num_motors` motors and a telemetry writer
    pub fn split(
        self,
        num_motors: usize,
    ) -> (HostReader<ReadHalf<SerialStream>>, TelemetryWriter) {
        let (read_half, write_half) = tokio::io::split(self.port);
        let writer: AsyncPort<WriteHalf<SerialStream>> = AsyncPort::new(write_half);
        (
            HostReader::new(read_half, num_motors),
            TelemetryWriter::new(Box::new(writer)),
        )
    }
}

/// Reads throttle packets from the host
#[derive(Debug)]
pub struct HostReader<R> {
    reader: R,
    parser: InputParser,
    ready: VecDeque<Vec<u16>>,
}

impl<R> HostReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, num_motors: usize) -> Self {
        Self {
            reader,
            parser: InputParser::new(num_motors),
            ready: VecDeque::new(),
        }
    }

    /// Wait for the next valid throttle packet
    ///
    /// # Returns
    ///
    /// * `Ok(Some(values))` - Raw host throttle values, one per motor
    /// * `Ok(None)` - The port reached end of stream
    ///
    /// # Errors
    ///
    /// Returns error if reading from the port fails
    pub async fn next_throttles(&mut self) -> Result<Option<Vec<u16>>> {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }

            let n = self
                .reader
                .read(&mut buf)
                .await
                .map_err(|e| DshotBridgeError::Serial(format!("Failed to read host packet: {}", e)))?;

            if n == 0 {
                return Ok(None);
            }

            self.ready.extend(self.parser.feed(&buf[..n]));
        }
    }

    /// Packets dropped for a bad checksum so far
    pub fn checksum_errors(&self) -> u64 {
        self.parser.checksum_errors()
    }
}

/// Writes telemetry packets to the host
pub struct TelemetryWriter {
    port: Box<dyn SerialPortIO>,
    packets_sent: u64,
}

impl std::fmt::Debug for TelemetryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryWriter")
            .field("packets_sent", &self.packets_sent)
            .finish_non_exhaustive()
    }
}

impl TelemetryWriter {
    pub fn new(port: Box<dyn SerialPortIO>) -> Self {
        Self { port, packets_sent: 0 }
    }

    /// Send one complete telemetry packet
    ///
    /// # Errors
    ///
    /// Returns error if the write or flush fails
    pub async fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port
            .write_all(packet)
            .await
            .map_err(|e| DshotBridgeError::Serial(format!("Failed to write packet: {}", e)))?;

        self.port
            .flush()
            .await
            .map_err(|e| DshotBridgeError::Serial(format!("Failed to flush serial port: {}", e)))?;

        self.packets_sent += 1;
        Ok(())
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }
}
