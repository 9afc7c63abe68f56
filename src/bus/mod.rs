//! # Motor Bus Module
//!
//! Multiplexes several DShot channels onto one bit serializer.
//!
//! This module handles:
//! - Round-robin addressing of one channel per control cycle
//! - Command repetition and post-command ESC processing delays
//! - Telemetry decoding, per-channel statistics and sink dispatch
//! - The bus-wide idle failsafe
//!
//! A cycle is split in two so other work can run while the frame is on the
//! wire: [`MotorBus::start`] submits the addressed channel's frame and
//! [`MotorBus::complete`] collects and decodes the reply.

pub mod channel;
pub mod clock;
pub mod sim;
pub mod transport;

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::dshot::decoder::decode_telemetry;
use crate::dshot::protocol::*;
use crate::error::{DshotBridgeError, Result};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

pub use channel::{ChannelState, ChannelStats};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use transport::{ProgramRegistry, TransportPort};

/// Default wait for the ESC reply after a frame goes out
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_micros(500);

/// Smallest repeat count that gets a command onto the wire at least once.
///
/// A channel is addressed every `num_channels` cycles and every visit uses up
/// one repeat, including visits spent waiting out a post-command delay. The
/// final repeat hands the channel back to its throttle, so a delayed command
/// needs one visit past the deadline plus one more.
///
/// # Arguments
///
/// * `command` - Raw command payload
/// * `num_channels` - Channels sharing the bus
/// * `cycle_period` - Time between two bus cycles
pub fn min_command_repeat(command: u16, num_channels: usize, cycle_period: Duration) -> u32 {
    let Some(delay) = post_delay(command) else {
        return 2;
    };

    let visit_period = cycle_period.as_nanos() * num_channels.max(1) as u128;
    if visit_period == 0 {
        return u32::MAX;
    }

    let visits = delay.as_nanos().div_ceil(visit_period);
    u32::try_from(visits).unwrap_or(u32::MAX).saturating_add(2)
}

/// Group of DShot channels sharing one serializer
pub struct MotorBus<T: TransportPort, C: Clock = MonotonicClock> {
    channels: Vec<ChannelState>,
    current_channel: usize,
    transport: T,
    clock: C,
    speed: DshotSpeed,
    last_command_time: Instant,
    idle_timeout: Duration,
    rx_timeout: Duration,
    awaiting_reply: bool,
    failsafe_engaged: bool,
    sink: Option<Box<dyn TelemetrySink>>,
}

impl<T: TransportPort, C: Clock> std::fmt::Debug for MotorBus<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorBus")
            .field("num_channels", &self.channels.len())
            .field("current_channel", &self.current_channel)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl<T: TransportPort, C: Clock> MotorBus<T, C> {
    /// Create a bus of `num_channels` channels, all at neutral throttle
    ///
    /// # Arguments
    ///
    /// * `num_channels` - Number of multiplexed channels (1-26)
    /// * `speed` - Protocol bit rate
    /// * `transport` - Serializer driving the channel pins
    /// * `clock` - Time source for delays and the failsafe
    /// * `registry` - Program registry shared with other buses on the same serializer family
    ///
    /// # Errors
    ///
    /// Returns `InvalidChannelCount` if `num_channels` is 0 or above the maximum
    pub fn new(
        num_channels: usize,
        speed: DshotSpeed,
        mut transport: T,
        clock: C,
        registry: &ProgramRegistry,
    ) -> Result<Self> {
        if num_channels == 0 || num_channels > DSHOT_MAX_CHANNELS {
            return Err(DshotBridgeError::InvalidChannelCount(num_channels));
        }

        let offset = registry.program_offset(&mut transport);
        transport.attach(offset, speed);

        // Rest on the last channel so the first cycle addresses channel 0
        let current_channel = num_channels - 1;
        transport.select_channel(current_channel);

        let now = clock.now();
        let mut bus = Self {
            channels: vec![ChannelState::new(); num_channels],
            current_channel,
            transport,
            clock,
            speed,
            last_command_time: now,
            idle_timeout: DSHOT_IDLE_THRESHOLD,
            rx_timeout: DEFAULT_RX_TIMEOUT,
            awaiting_reply: false,
            failsafe_engaged: false,
            sink: None,
        };

        for channel in 0..num_channels {
            bus.set_throttle(channel, DSHOT_THROTTLE_NEUTRAL);
        }

        debug!(
            "Motor bus ready: {} channels at DShot{} (program offset {})",
            num_channels,
            speed.khz(),
            offset
        );
        Ok(bus)
    }

    /// Override the idle failsafe window
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Override the reply wait bound
    pub fn with_rx_timeout(mut self, rx_timeout: Duration) -> Self {
        self.rx_timeout = rx_timeout;
        self
    }

    /// Register the receiver of decoded telemetry
    pub fn set_sink<S: TelemetrySink + 'static>(&mut self, sink: S) {
        self.sink = Some(Box::new(sink));
    }

    /// Set a channel's throttle (0 = neutral, clamped to 2047).
    ///
    /// Cancels any repeating command or post-command delay on the channel.
    /// Out-of-range channels are ignored.
    pub fn set_throttle(&mut self, channel: usize, throttle: u16) {
        if channel >= self.channels.len() {
            return;
        }

        self.apply_throttle(channel, throttle.min(DSHOT_PAYLOAD_MAX));
        self.failsafe_engaged = false;
    }

    /// Send a command (0-47) on a channel for `repeat_count` cycles.
    ///
    /// Supersedes any pending command or delay on the channel. Out-of-range
    /// channels and command values are ignored.
    pub fn send_command(&mut self, channel: usize, command: u16, repeat_count: u8) {
        if command > DSHOT_MAX_COMMAND {
            return;
        }

        let now = self.clock.now();
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };

        state.send_command(command, repeat_count, now);
        debug!(
            "Channel {}: command {} x{}{}",
            channel,
            command,
            repeat_count,
            if state.is_delaying() { " (delaying)" } else { "" }
        );

        self.last_command_time = now;
        self.failsafe_engaged = false;
    }

    /// Typed form of [`send_command`](Self::send_command)
    pub fn send(&mut self, channel: usize, command: Command, repeat_count: u8) {
        self.send_command(channel, command.value(), repeat_count);
    }

    /// First half of a cycle: address the next channel and submit its frame
    ///
    /// # Returns
    ///
    /// * `bool` - `true` if a frame was handed to the transport
    pub fn start(&mut self) -> bool {
        if self.channels.len() > 1 {
            self.current_channel = (self.current_channel + 1) % self.channels.len();
            self.transport.select_channel(self.current_channel);
        }

        let channel = self.current_channel;
        let now = self.clock.now();
        let state = &mut self.channels[channel];

        if state.tick_repeat() {
            debug!("Channel {}: command repeat finished, throttle restored", channel);
        }

        self.awaiting_reply = false;
        if state.poll_delay(now) && self.transport.is_ready() {
            self.transport
                .submit(state.frame(), self.speed.bit_period_cycles());
            state.stats_mut().tx_frames = state.stats().tx_frames.wrapping_add(1);
            self.awaiting_reply = true;
        }

        self.awaiting_reply
    }

    /// Second half of a cycle: decode the reply and enforce the idle failsafe
    ///
    /// # Returns
    ///
    /// * `Option<TelemetryEvent>` - The decoded event, if any
    pub fn complete(&mut self) -> Option<TelemetryEvent> {
        let event = if self.awaiting_reply {
            self.awaiting_reply = false;
            let raw = self.transport.receive(self.rx_timeout);
            self.receive(raw)
        } else {
            None
        };

        self.check_idle();
        event
    }

    /// Run one full cycle
    pub fn run_cycle(&mut self) -> Option<TelemetryEvent> {
        self.start();
        self.complete()
    }

    fn receive(&mut self, raw: u32) -> Option<TelemetryEvent> {
        let channel = self.current_channel;
        let stats = self.channels[channel].stats_mut();

        match decode_telemetry(raw) {
            Ok((kind, value)) => {
                stats.rx_frames = stats.rx_frames.wrapping_add(1);
                let event = TelemetryEvent {
                    channel,
                    kind,
                    value,
                };
                trace!(channel, %kind, value, "Telemetry");
                if let Some(sink) = self.sink.as_mut() {
                    sink.on_telemetry(event);
                }
                Some(event)
            }
            Err(e) => {
                trace!(channel, raw, "Dropped telemetry: {}", e);
                stats.record_error(e);
                None
            }
        }
    }

    fn check_idle(&mut self) {
        let idle = self
            .clock
            .now()
            .saturating_duration_since(self.last_command_time);
        if idle <= self.idle_timeout {
            return;
        }

        if !self.failsafe_engaged {
            warn!(
                "No motor commands for {} ms, forcing all channels to neutral",
                idle.as_millis()
            );
            self.failsafe_engaged = true;
        }

        for channel in 0..self.channels.len() {
            self.apply_throttle(channel, DSHOT_THROTTLE_NEUTRAL);
        }
    }

    fn apply_throttle(&mut self, channel: usize, throttle: u16) {
        self.channels[channel].set_throttle(throttle);
        self.last_command_time = self.clock.now();
    }

    /// Number of channels
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Channel addressed by the most recent cycle
    pub fn current_channel(&self) -> usize {
        self.current_channel
    }

    /// Protocol speed
    pub fn speed(&self) -> DshotSpeed {
        self.speed
    }

    /// State of one channel
    pub fn channel(&self, channel: usize) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    /// Resident frame of one channel
    pub fn frame(&self, channel: usize) -> Option<u16> {
        self.channels.get(channel).map(ChannelState::frame)
    }

    /// Statistics of one channel
    pub fn stats(&self, channel: usize) -> Option<ChannelStats> {
        self.channels.get(channel).map(|c| *c.stats())
    }

    /// Whether a channel has no command repetition or delay pending
    pub fn is_settled(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map(ChannelState::is_settled)
            .unwrap_or(true)
    }

    /// Whether every channel is settled
    pub fn all_settled(&self) -> bool {
        self.channels.iter().all(ChannelState::is_settled)
    }

    /// Whether the idle failsafe has fired since the last host call
    pub fn failsafe_engaged(&self) -> bool {
        self.failsafe_engaged
    }

    /// Time of the last throttle or command update
    pub fn last_command_time(&self) -> Instant {
        self.last_command_time
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }
}
