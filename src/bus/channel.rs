//! # Channel State
//!
//! Per-channel transmit state and receive statistics of a motor bus.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::dshot::encoder::{command_frame, throttle_frame};
use crate::dshot::protocol::{post_delay, DSHOT_THROTTLE_NEUTRAL};
use crate::error::TelemetryError;

/// Frame and telemetry counters for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Frames handed to the transport
    pub tx_frames: u32,

    /// Telemetry frames decoded successfully
    pub rx_frames: u32,

    /// Listen windows with no capture
    pub rx_timeout: u32,

    /// Captures containing a non-codeword GCR group
    pub rx_bad_gcr: u32,

    /// Captures failing the telemetry checksum
    pub rx_bad_crc: u32,

    /// Extended telemetry with an unknown prefix
    pub rx_bad_type: u32,
}

impl ChannelStats {
    /// Count a failed capture under its error kind
    pub fn record_error(&mut self, error: TelemetryError) {
        let counter = match error {
            TelemetryError::Timeout => &mut self.rx_timeout,
            TelemetryError::BadGcr => &mut self.rx_bad_gcr,
            TelemetryError::BadCrc => &mut self.rx_bad_crc,
            TelemetryError::BadType => &mut self.rx_bad_type,
        };
        *counter = counter.wrapping_add(1);
    }

    /// Total failed captures of every kind
    pub fn rx_errors(&self) -> u32 {
        self.rx_timeout
            .wrapping_add(self.rx_bad_gcr)
            .wrapping_add(self.rx_bad_crc)
            .wrapping_add(self.rx_bad_type)
    }
}

/// Transmit state of one multiplexed channel.
///
/// While `repeat_counter > 0` the resident frame is a command frame; when the
/// counter reaches zero the frame reverts to the last throttle frame. While a
/// delay deadline is set nothing is transmitted on the channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    frame: u16,
    last_throttle_frame: u16,
    repeat_counter: u8,
    delay_deadline: Option<Instant>,
    stats: ChannelStats,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelState {
    /// New channel resting at neutral throttle
    pub fn new() -> Self {
        let neutral = throttle_frame(DSHOT_THROTTLE_NEUTRAL);
        Self {
            frame: neutral,
            last_throttle_frame: neutral,
            repeat_counter: 0,
            delay_deadline: None,
            stats: ChannelStats::default(),
        }
    }

    /// Make a throttle frame resident, cancelling any pending command
    pub fn set_throttle(&mut self, throttle: u16) {
        self.frame = throttle_frame(throttle);
        self.last_throttle_frame = self.frame;
        self.repeat_counter = 0;
        self.delay_deadline = None;
    }

    /// Make a command frame resident for `repeat_count` cycles.
    ///
    /// Save-settings and info requests also start a processing delay measured
    /// from `now`; any earlier delay is dropped.
    pub fn send_command(&mut self, command: u16, repeat_count: u8, now: Instant) {
        self.frame = command_frame(command);
        self.repeat_counter = repeat_count;
        self.delay_deadline = post_delay(command).map(|delay: Duration| now + delay);
    }

    /// Advance the repeat counter by one cycle
    ///
    /// # Returns
    ///
    /// * `bool` - `true` if this cycle ended the repeat and restored throttle
    pub fn tick_repeat(&mut self) -> bool {
        if self.repeat_counter == 0 {
            return false;
        }

        self.repeat_counter -= 1;
        if self.repeat_counter == 0 {
            self.frame = self.last_throttle_frame;
            return true;
        }

        false
    }

    /// Clear an elapsed delay and report whether the channel may transmit
    pub fn poll_delay(&mut self, now: Instant) -> bool {
        match self.delay_deadline {
            Some(deadline) if now >= deadline => {
                debug!("Post-command delay elapsed");
                self.delay_deadline = None;
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Currently resident transmit frame
    pub fn frame(&self) -> u16 {
        self.frame
    }

    /// Most recent throttle frame
    pub fn last_throttle_frame(&self) -> u16 {
        self.last_throttle_frame
    }

    /// Remaining command repetitions
    pub fn repeat_counter(&self) -> u8 {
        self.repeat_counter
    }

    /// Pending post-command deadline, if any
    pub fn delay_deadline(&self) -> Option<Instant> {
        self.delay_deadline
    }

    /// Whether a post-command delay is active
    pub fn is_delaying(&self) -> bool {
        self.delay_deadline.is_some()
    }

    /// No command repetition or delay is pending
    pub fn is_settled(&self) -> bool {
        self.repeat_counter == 0 && self.delay_deadline.is_none()
    }

    /// Receive statistics
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Mutable receive statistics
    pub fn stats_mut(&mut self) -> &mut ChannelStats {
        &mut self.stats
    }
}
