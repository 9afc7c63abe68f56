//! # Simulated ESC Transport
//!
//! A software [`TransportPort`] that plays the part of the serializer and of
//! one bidirectional-DShot ESC per channel. Each accepted frame is checked,
//! applied to the addressed ESC model, and answered with a GCR-encoded
//! telemetry reply captured exactly as the hardware would capture it.
//!
//! Handles are cheap clones sharing one state, so a test can keep a handle
//! while the bus owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use super::transport::TransportPort;
use crate::dshot::crc::{frame_crc_valid, telemetry_crc};
use crate::dshot::decoder::GCR_CODEWORDS;
use crate::dshot::encoder::{frame_from_wire_word, frame_payload, frame_telemetry_bit, wire_word};
use crate::dshot::protocol::*;

/// Offset reported when the simulated program is installed
pub const SIM_PROGRAM_OFFSET: u32 = 0;

/// eRPM per throttle step above the 3D deadband
const SIM_ERPM_PER_STEP: u32 = 50;

/// With EDT enabled, every Nth reply is an extended frame
const SIM_EDT_INTERVAL: u32 = 8;

/// System clock the simulated serializer divides down from
pub const SIM_SYS_CLOCK_HZ: u32 = 125_000_000;

/// Most recent submissions kept for inspection
pub const SIM_SUBMISSION_HISTORY: usize = 1024;

/// Transition-encode a 21-bit GCR word (leading start bit forced high).
///
/// This is the inverse of the receiver's `raw ^ (raw >> 1)`.
pub fn transition_encode(gcr: u32) -> u32 {
    let gcr = (gcr | (1 << 20)) & 0x1F_FFFF;
    let mut raw = 0u32;

    for bit in (0..=20).rev() {
        let prev = (raw >> (bit + 1)) & 1;
        raw |= (((gcr >> bit) & 1) ^ prev) << bit;
    }

    raw
}

/// Encode a 16-bit telemetry frame as the raw word the serializer captures
pub fn encode_reply(frame: u16) -> u32 {
    let gcr = (0..4).rev().fold(0u32, |gcr, i| {
        let nibble = (frame >> (i * 4)) & 0x0F;
        (gcr << 5) | GCR_CODEWORDS[nibble as usize] as u32
    });
    transition_encode(gcr)
}

/// Append the telemetry checksum to 12 bits of data
fn checksummed(upper: u16) -> u16 {
    let frame = (upper & 0x0FFF) << 4;
    frame | telemetry_crc(frame)
}

/// eRPM telemetry frame for a commutation period in microseconds.
///
/// The mantissa is normalized so its top bit is set whenever the exponent is
/// nonzero, which keeps the prefix clear of extended telemetry codes. Periods
/// too long to encode read as a stopped motor.
pub fn erpm_reply_frame(period_us: u32) -> u16 {
    if period_us >= DSHOT_ERPM_PERIOD_STOPPED {
        return checksummed((7 << 9) | 0x1FF);
    }

    let mut e = 0u16;
    let mut m = period_us;
    while m > 0x1FF {
        m >>= 1;
        e += 1;
    }

    checksummed((e << 9) | m as u16)
}

/// Extended telemetry frame carrying an 8-bit value
pub fn edt_reply_frame(kind: TelemetryKind, value: u8) -> Option<u16> {
    let prefix = match kind {
        TelemetryKind::Temperature => 0x2,
        TelemetryKind::Voltage => 0x4,
        TelemetryKind::Current => 0x6,
        TelemetryKind::Debug1 => 0x8,
        TelemetryKind::Debug2 => 0xA,
        TelemetryKind::Stress => 0xC,
        TelemetryKind::Status => 0xE,
        TelemetryKind::Erpm => return None,
    };
    Some(checksummed((prefix << 8) | value as u16))
}

/// One frame accepted by the simulated serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub channel: usize,

    /// Word as loaded into the FIFO
    pub word: u32,

    /// Frame the ESC saw on the line
    pub frame: u16,

    pub bit_period_cycles: u32,
}

/// State of a simulated ESC
#[derive(Debug, Clone, Default)]
pub struct EscModel {
    /// Last throttle payload received
    pub throttle: u16,

    /// Last command received, if any
    pub last_command: Option<u16>,

    /// Extended telemetry enabled by command
    pub edt_enabled: bool,

    /// Replies sent so far
    pub replies: u32,

    /// Frames rejected for a bad checksum
    pub rejected: u32,
}

impl EscModel {
    /// Simulated eRPM for the current throttle (3D: distance from the deadband)
    pub fn erpm(&self) -> u32 {
        let steps = match self.throttle {
            t if t >= 1048 => (t - 1047) as u32,
            t if t >= 48 => (t - 47) as u32,
            _ => 0,
        };
        steps * SIM_ERPM_PER_STEP
    }

    fn next_reply(&mut self) -> u16 {
        self.replies = self.replies.wrapping_add(1);

        if self.edt_enabled && self.replies % SIM_EDT_INTERVAL == 0 {
            let slot = (self.replies / SIM_EDT_INTERVAL) % 4;
            let (kind, value) = match slot {
                0 => (TelemetryKind::Status, 0x80),
                1 => (TelemetryKind::Temperature, 42),
                2 => (TelemetryKind::Voltage, 64),
                _ => (TelemetryKind::Current, 3),
            };
            if let Some(frame) = edt_reply_frame(kind, value) {
                return frame;
            }
        }

        match self.erpm() {
            0 => erpm_reply_frame(DSHOT_ERPM_PERIOD_STOPPED),
            erpm => erpm_reply_frame(DSHOT_ERPM_PERIOD_SCALE / erpm),
        }
    }
}

#[derive(Debug)]
struct SimState {
    escs: Vec<EscModel>,
    channel: usize,
    ready: bool,
    attached: Option<(u32, DshotSpeed)>,
    clock_divider: Option<f32>,
    program_loads: u32,
    pending: Option<u32>,
    injected: VecDeque<u32>,
    silent: bool,
    submissions: VecDeque<Submission>,
}

/// Simulated serializer with one ESC per channel
#[derive(Debug, Clone)]
pub struct SimulatedEsc {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedEsc {
    /// Create a simulator for `channels` ESCs
    pub fn new(channels: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                escs: vec![EscModel::default(); channels],
                channel: 0,
                ready: true,
                attached: None,
                clock_divider: None,
                program_loads: 0,
                pending: None,
                injected: VecDeque::new(),
                silent: false,
                submissions: VecDeque::with_capacity(SIM_SUBMISSION_HISTORY),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock leaves the state usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of one simulated ESC
    pub fn esc(&self, channel: usize) -> Option<EscModel> {
        self.lock().escs.get(channel).cloned()
    }

    /// Number of simulated ESCs
    pub fn esc_count(&self) -> usize {
        self.lock().escs.len()
    }

    /// Frames accepted so far, oldest first.
    ///
    /// Only the last [`SIM_SUBMISSION_HISTORY`] are kept.
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.iter().copied().collect()
    }

    /// Forget recorded submissions
    pub fn clear_submissions(&self) {
        self.lock().submissions.clear();
    }

    /// Currently selected channel
    pub fn selected_channel(&self) -> usize {
        self.lock().channel
    }

    /// Program offset and speed the transport was attached with
    pub fn attached(&self) -> Option<(u32, DshotSpeed)> {
        self.lock().attached
    }

    /// Serializer clock divider set up on attach
    pub fn clock_divider(&self) -> Option<f32> {
        self.lock().clock_divider
    }

    /// Number of times the program was installed
    pub fn program_loads(&self) -> u32 {
        self.lock().program_loads
    }

    /// Simulate a busy FIFO
    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Stop answering (every capture reads as nothing)
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Queue a raw word returned by the next receive instead of a real reply
    pub fn inject(&self, raw: u32) {
        self.lock().injected.push_back(raw);
    }
}

impl TransportPort for SimulatedEsc {
    fn load_program(&mut self) -> u32 {
        self.lock().program_loads += 1;
        SIM_PROGRAM_OFFSET
    }

    fn attach(&mut self, program_offset: u32, speed: DshotSpeed) {
        let mut state = self.lock();
        state.attached = Some((program_offset, speed));
        state.clock_divider = Some(speed.clock_divider(SIM_SYS_CLOCK_HZ));
    }

    fn select_channel(&mut self, channel: usize) {
        let mut state = self.lock();
        state.channel = channel;
        state.pending = None;
    }

    fn is_ready(&self) -> bool {
        self.lock().ready
    }

    fn submit(&mut self, frame: u16, bit_period_cycles: u32) {
        let mut state = self.lock();
        let channel = state.channel;

        // The ESC sees whatever the FIFO word shifts out
        let word = wire_word(frame);
        let frame = frame_from_wire_word(word);

        if state.submissions.len() == SIM_SUBMISSION_HISTORY {
            state.submissions.pop_front();
        }
        state.submissions.push_back(Submission {
            channel,
            word,
            frame,
            bit_period_cycles,
        });

        let silent = state.silent;
        let Some(esc) = state.escs.get_mut(channel) else {
            return;
        };

        if !frame_crc_valid(frame) {
            esc.rejected += 1;
            return;
        }

        let payload = frame_payload(frame);
        if frame_telemetry_bit(frame) && payload <= DSHOT_MAX_COMMAND {
            esc.last_command = Some(payload);
            if payload == Command::ExtendedTelemetryEnable.value() {
                esc.edt_enabled = true;
            } else if payload == Command::ExtendedTelemetryDisable.value() {
                esc.edt_enabled = false;
            }
        } else {
            esc.throttle = payload;
        }

        let reply = esc.next_reply();
        trace!(channel, frame, reply, "Simulated ESC reply");
        if !silent {
            state.pending = Some(encode_reply(reply));
        }
    }

    fn receive(&mut self, _timeout: Duration) -> u32 {
        let mut state = self.lock();
        if let Some(raw) = state.injected.pop_front() {
            state.pending = None;
            return raw;
        }
        state.pending.take().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dshot::decoder::decode_telemetry;
    use crate::dshot::encoder::{command_frame, throttle_frame};

    #[test]
    fn test_transition_encode_inverts_receiver() {
        for gcr in [0u32, 0x12345, 0xFFFFF, 0xA5A5A] {
            let raw = transition_encode(gcr);
            assert_eq!((raw ^ (raw >> 1)) & 0xFFFFF, gcr);
        }
    }

    #[test]
    fn test_reply_frames_decode() {
        let raw = encode_reply(erpm_reply_frame(1000));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 60_000)));

        let raw = encode_reply(edt_reply_frame(TelemetryKind::Temperature, 55).unwrap());
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Temperature, 55)));

        assert!(edt_reply_frame(TelemetryKind::Erpm, 1).is_none());
    }

    #[test]
    fn test_long_period_reads_as_stopped() {
        let raw = encode_reply(erpm_reply_frame(100_000));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 0)));
    }

    #[test]
    fn test_throttle_reply() {
        let mut sim = SimulatedEsc::new(2);
        sim.select_channel(1);
        sim.submit(throttle_frame(1048 + 99), 300);

        let esc = sim.esc(1).unwrap();
        assert_eq!(esc.throttle, 1147);
        assert_eq!(esc.erpm(), 5_000);

        let raw = sim.receive(Duration::from_micros(100));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 5_000)));
        assert_eq!(sim.receive(Duration::from_micros(100)), 0);
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let mut sim = SimulatedEsc::new(1);
        sim.submit(throttle_frame(500) ^ 0x0001, 300);
        assert_eq!(sim.esc(0).unwrap().rejected, 1);
        assert_eq!(sim.receive(Duration::ZERO), 0);
    }

    #[test]
    fn test_edt_enable_command() {
        let mut sim = SimulatedEsc::new(1);
        sim.submit(command_frame(Command::ExtendedTelemetryEnable.value()), 300);
        let esc = sim.esc(0).unwrap();
        assert!(esc.edt_enabled);
        assert_eq!(esc.last_command, Some(13));

        // Eighth reply is the first extended frame
        let mut kinds = Vec::new();
        for _ in 0..8 {
            sim.submit(throttle_frame(0), 300);
            let (kind, _) = decode_telemetry(sim.receive(Duration::ZERO)).unwrap();
            kinds.push(kind);
        }
        assert!(kinds.contains(&TelemetryKind::Temperature));
    }

    #[test]
    fn test_injected_word_wins() {
        let mut sim = SimulatedEsc::new(1);
        sim.inject(0xDEAD);
        sim.submit(throttle_frame(0), 300);
        assert_eq!(sim.receive(Duration::ZERO), 0xDEAD);
    }

    #[test]
    fn test_submission_carries_fifo_word() {
        let mut sim = SimulatedEsc::new(1);
        sim.submit(throttle_frame(0), 300);

        let submission = sim.submissions()[0];
        assert_eq!(submission.word, 0xFFF0_0000);
        assert_eq!(submission.frame, 0x000F);
    }

    #[test]
    fn test_submission_history_bounded() {
        let mut sim = SimulatedEsc::new(4);
        for i in 0..(SIM_SUBMISSION_HISTORY as u16 * 3) {
            sim.select_channel(i as usize % 4);
            sim.submit(throttle_frame(i % 2048), 300);
        }

        let submissions = sim.submissions();
        assert_eq!(submissions.len(), SIM_SUBMISSION_HISTORY);
        let last = SIM_SUBMISSION_HISTORY as u16 * 3 - 1;
        assert_eq!(submissions.last().map(|s| frame_payload(s.frame)), Some(last % 2048));
        assert_eq!(sim.esc(0).unwrap().replies, SIM_SUBMISSION_HISTORY as u32 * 3 / 4);
    }

    #[test]
    fn test_attach_sets_clock_divider() {
        let mut sim = SimulatedEsc::new(1);
        assert_eq!(sim.clock_divider(), None);

        sim.attach(SIM_PROGRAM_OFFSET, DshotSpeed::DShot600);
        let div = sim.clock_divider().unwrap();
        // 125 MHz / (600 kbit/s * 40 ticks per bit)
        assert!((div - 5.208_333).abs() < 0.001);
    }

    #[test]
    fn test_silent_returns_nothing() {
        let mut sim = SimulatedEsc::new(1);
        sim.set_silent(true);
        sim.submit(throttle_frame(100), 300);
        assert_eq!(sim.receive(Duration::ZERO), 0);
    }
}
