//! # DShot Protocol Constants and Types
//!
//! Core protocol definitions for bidirectional DShot.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of channels a single motor bus can multiplex
pub const DSHOT_MAX_CHANNELS: usize = 26;

/// Payload range (11-bit: 0-2047)
pub const DSHOT_PAYLOAD_MAX: u16 = 2047;

/// Payload 0 with telemetry bit clear: disarmed / neutral
pub const DSHOT_THROTTLE_NEUTRAL: u16 = 0;

/// Command payloads occupy 0-47
pub const DSHOT_MAX_COMMAND: u16 = 47;

/// Bus-wide idle window after which every channel is forced to neutral
pub const DSHOT_IDLE_THRESHOLD: Duration = Duration::from_millis(500);

/// ESC processing time after a save-settings command
pub const DSHOT_SAVE_SETTINGS_DELAY: Duration = Duration::from_millis(35);

/// ESC processing time after an info request command
pub const DSHOT_ESC_INFO_DELAY: Duration = Duration::from_millis(12);

/// Commutation period reported by a stopped motor
pub const DSHOT_ERPM_PERIOD_STOPPED: u32 = 0xFF80;

/// Microseconds per minute, numerator of the period to eRPM conversion
pub const DSHOT_ERPM_PERIOD_SCALE: u32 = 60_000_000;

/// Special commands sent with the telemetry bit set.
///
/// Values 15-19 and 36-41 are unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum Command {
    MotorStop = 0,
    Beep1 = 1,
    Beep2 = 2,
    Beep3 = 3,
    Beep4 = 4,
    Beep5 = 5,
    EscInfo = 6,
    SpinDirection1 = 7,
    SpinDirection2 = 8,
    #[serde(rename = "3d_mode_off")]
    ThreeDModeOff = 9,
    #[serde(rename = "3d_mode_on")]
    ThreeDModeOn = 10,
    SettingsRequest = 11,
    SaveSettings = 12,
    ExtendedTelemetryEnable = 13,
    ExtendedTelemetryDisable = 14,
    SpinDirectionNormal = 20,
    SpinDirectionReversed = 21,
    Led0On = 22,
    Led1On = 23,
    Led2On = 24,
    Led3On = 25,
    Led0Off = 26,
    Led1Off = 27,
    Led2Off = 28,
    Led3Off = 29,
    AudioStreamToggle = 30,
    SilentModeToggle = 31,
    SignalLineTelemetryDisable = 32,
    SignalLineTelemetryEnable = 33,
    SignalLineContinuousErpmTelemetry = 34,
    SignalLineContinuousErpmPeriodTelemetry = 35,
    SignalLineTemperatureTelemetry = 42,
    SignalLineVoltageTelemetry = 43,
    SignalLineCurrentTelemetry = 44,
    SignalLineConsumptionTelemetry = 45,
    SignalLineErpmTelemetry = 46,
    SignalLineErpmPeriodTelemetry = 47,
}

impl Command {
    /// Every assigned command, in payload order
    pub const ALL: [Command; 37] = [
        Command::MotorStop,
        Command::Beep1,
        Command::Beep2,
        Command::Beep3,
        Command::Beep4,
        Command::Beep5,
        Command::EscInfo,
        Command::SpinDirection1,
        Command::SpinDirection2,
        Command::ThreeDModeOff,
        Command::ThreeDModeOn,
        Command::SettingsRequest,
        Command::SaveSettings,
        Command::ExtendedTelemetryEnable,
        Command::ExtendedTelemetryDisable,
        Command::SpinDirectionNormal,
        Command::SpinDirectionReversed,
        Command::Led0On,
        Command::Led1On,
        Command::Led2On,
        Command::Led3On,
        Command::Led0Off,
        Command::Led1Off,
        Command::Led2Off,
        Command::Led3Off,
        Command::AudioStreamToggle,
        Command::SilentModeToggle,
        Command::SignalLineTelemetryDisable,
        Command::SignalLineTelemetryEnable,
        Command::SignalLineContinuousErpmTelemetry,
        Command::SignalLineContinuousErpmPeriodTelemetry,
        Command::SignalLineTemperatureTelemetry,
        Command::SignalLineVoltageTelemetry,
        Command::SignalLineCurrentTelemetry,
        Command::SignalLineConsumptionTelemetry,
        Command::SignalLineErpmTelemetry,
        Command::SignalLineErpmPeriodTelemetry,
    ];

    /// Raw 11-bit payload of this command
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Time the ESC needs to process this command before it listens again.
    ///
    /// # Returns
    ///
    /// * `Option<Duration>` - `Some` for save-settings and info requests, `None` otherwise
    pub fn post_delay(self) -> Option<Duration> {
        post_delay(self.value())
    }
}

impl TryFrom<u16> for Command {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.value() == value)
            .ok_or(value)
    }
}

impl From<Command> for u16 {
    fn from(cmd: Command) -> u16 {
        cmd.value()
    }
}

/// Post-command delay for a raw command payload
pub fn post_delay(command: u16) -> Option<Duration> {
    if command == Command::SaveSettings.value() {
        Some(DSHOT_SAVE_SETTINGS_DELAY)
    } else if command == Command::EscInfo.value() {
        Some(DSHOT_ESC_INFO_DELAY)
    } else {
        None
    }
}

/// Kind of value carried by a decoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Erpm,
    Voltage,
    Current,
    Temperature,
    Status,
    Debug1,
    Debug2,
    Stress,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TelemetryKind::Erpm => "erpm",
            TelemetryKind::Voltage => "voltage",
            TelemetryKind::Current => "current",
            TelemetryKind::Temperature => "temperature",
            TelemetryKind::Status => "status",
            TelemetryKind::Debug1 => "debug1",
            TelemetryKind::Debug2 => "debug2",
            TelemetryKind::Stress => "stress",
        };
        f.write_str(name)
    }
}

/// Protocol bit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum DshotSpeed {
    DShot150,
    DShot300,
    DShot600,
    DShot1200,
}

impl DshotSpeed {
    /// Bit rate in kbit/s
    pub fn khz(self) -> u32 {
        match self {
            DshotSpeed::DShot150 => 150,
            DshotSpeed::DShot300 => 300,
            DshotSpeed::DShot600 => 600,
            DshotSpeed::DShot1200 => 1200,
        }
    }

    /// Cycle count handed to the serializer with every frame.
    ///
    /// The serializer runs 40 clock ticks per bit; the count covers the
    /// transmit-plus-listen window of one frame.
    pub fn bit_period_cycles(self) -> u32 {
        (25 * self.khz() * 40) / 1000
    }

    /// Serializer clock divider for a given system clock
    pub fn clock_divider(self, sys_clock_hz: u32) -> f32 {
        sys_clock_hz as f32 / (1000.0 * self.khz() as f32 * 40.0)
    }
}

impl TryFrom<u16> for DshotSpeed {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            150 => Ok(DshotSpeed::DShot150),
            300 => Ok(DshotSpeed::DShot300),
            600 => Ok(DshotSpeed::DShot600),
            1200 => Ok(DshotSpeed::DShot1200),
            other => Err(format!(
                "speed must be one of: 150, 300, 600, 1200 (got {})",
                other
            )),
        }
    }
}

impl From<DshotSpeed> for u16 {
    fn from(speed: DshotSpeed) -> u16 {
        speed.khz() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_constants() {
        assert_eq!(DSHOT_MAX_CHANNELS, 26);
        assert_eq!(DSHOT_PAYLOAD_MAX, 2047);
        assert_eq!(DSHOT_IDLE_THRESHOLD, Duration::from_millis(500));
        assert_eq!(DSHOT_ERPM_PERIOD_STOPPED, 0xFF80);
    }

    #[test]
    fn test_command_values() {
        assert_eq!(Command::MotorStop.value(), 0);
        assert_eq!(Command::EscInfo.value(), 6);
        assert_eq!(Command::SaveSettings.value(), 12);
        assert_eq!(Command::ExtendedTelemetryEnable.value(), 13);
        assert_eq!(Command::SignalLineErpmPeriodTelemetry.value(), 47);
    }

    #[test]
    fn test_command_try_from_roundtrips_assigned_values() {
        for cmd in Command::ALL {
            assert_eq!(Command::try_from(cmd.value()), Ok(cmd));
        }
    }

    #[test]
    fn test_command_try_from_rejects_unassigned() {
        for raw in [15u16, 19, 36, 41, 48, 2047] {
            assert_eq!(Command::try_from(raw), Err(raw));
        }
    }

    #[test]
    fn test_post_delay() {
        assert_eq!(Command::SaveSettings.post_delay(), Some(Duration::from_millis(35)));
        assert_eq!(Command::EscInfo.post_delay(), Some(Duration::from_millis(12)));
        assert_eq!(Command::Beep1.post_delay(), None);
        assert_eq!(Command::ThreeDModeOn.post_delay(), None);
    }

    #[test]
    fn test_bit_period_cycles() {
        assert_eq!(DshotSpeed::DShot150.bit_period_cycles(), 150);
        assert_eq!(DshotSpeed::DShot300.bit_period_cycles(), 300);
        assert_eq!(DshotSpeed::DShot600.bit_period_cycles(), 600);
        assert_eq!(DshotSpeed::DShot1200.bit_period_cycles(), 1200);
    }

    #[test]
    fn test_clock_divider() {
        // 125 MHz system clock at DShot300: 125e6 / 12e6
        let div = DshotSpeed::DShot300.clock_divider(125_000_000);
        assert!((div - 10.416_667).abs() < 0.001);
    }

    #[test]
    fn test_speed_try_from() {
        assert_eq!(DshotSpeed::try_from(600), Ok(DshotSpeed::DShot600));
        assert!(DshotSpeed::try_from(400).is_err());
    }

    #[test]
    fn test_command_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            command: Command,
        }

        let w: Wrapper = toml::from_str("command = \"3d_mode_on\"").unwrap();
        assert_eq!(w.command, Command::ThreeDModeOn);

        let w: Wrapper = toml::from_str("command = \"save_settings\"").unwrap();
        assert_eq!(w.command, Command::SaveSettings);
    }
}
