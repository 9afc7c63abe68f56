//! # Host Link Constants
//!
//! Packet layout and throttle scale of the host serial link.

use crate::dshot::protocol::{TelemetryKind, DSHOT_PAYLOAD_MAX, DSHOT_THROTTLE_NEUTRAL};

/// First byte of every inbound throttle packet
pub const INPUT_START_BYTE: u8 = 0x5A;

/// First byte of every outbound telemetry packet
pub const TELEMETRY_START_BYTE: u8 = 0xA5;

/// Outbound telemetry packet size: start + motor + type + i32 + checksum
pub const TELEMETRY_PACKET_SIZE: usize = 8;

/// Host throttle range (3D: reverse below neutral, forward above)
pub const HOST_THROTTLE_MIN: u16 = 0;
pub const HOST_THROTTLE_NEUTRAL: u16 = 1000;
pub const HOST_THROTTLE_MAX: u16 = 2000;

/// DShot 3D payload ranges
pub const DSHOT_3D_MIN_REVERSE: u16 = 48;
pub const DSHOT_3D_MAX_REVERSE: u16 = 1047;
pub const DSHOT_3D_MIN_FORWARD: u16 = 1048;
pub const DSHOT_3D_MAX_FORWARD: u16 = DSHOT_PAYLOAD_MAX;

/// Telemetry type codes on the host link
pub const TELEMETRY_TYPE_ERPM: u8 = 0;
pub const TELEMETRY_TYPE_VOLTAGE: u8 = 1;
pub const TELEMETRY_TYPE_TEMPERATURE: u8 = 2;
pub const TELEMETRY_TYPE_CURRENT: u8 = 3;

/// Inbound packet size for `num_motors` throttle values
pub fn input_packet_size(num_motors: usize) -> usize {
    1 + num_motors * 2 + 1
}

/// XOR of every byte
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Translate a host throttle (0-2000, 1000 neutral) to a DShot 3D payload.
///
/// Values above neutral map onto 1048-2047, values below onto 1047-48 (the
/// further from neutral, the faster in reverse). Anything out of range is
/// treated as neutral.
///
/// # Examples
///
/// ```
/// use dshot_bridge::link::protocol::translate_throttle;
///
/// assert_eq!(translate_throttle(1000), 0);
/// assert_eq!(translate_throttle(2000), 2047);
/// assert_eq!(translate_throttle(0), 1047);
/// ```
pub fn translate_throttle(host: u16) -> u16 {
    match host {
        HOST_THROTTLE_NEUTRAL => DSHOT_THROTTLE_NEUTRAL,
        v if v > HOST_THROTTLE_NEUTRAL && v <= HOST_THROTTLE_MAX => {
            (v - HOST_THROTTLE_NEUTRAL - 1) + DSHOT_3D_MIN_FORWARD
        }
        v if v < HOST_THROTTLE_NEUTRAL => DSHOT_3D_MAX_REVERSE - v,
        _ => DSHOT_THROTTLE_NEUTRAL,
    }
}

/// Host link type code for a telemetry kind, if the kind is forwarded
pub fn telemetry_type_code(kind: TelemetryKind) -> Option<u8> {
    match kind {
        TelemetryKind::Erpm => Some(TELEMETRY_TYPE_ERPM),
        TelemetryKind::Voltage => Some(TELEMETRY_TYPE_VOLTAGE),
        TelemetryKind::Temperature => Some(TELEMETRY_TYPE_TEMPERATURE),
        TelemetryKind::Current => Some(TELEMETRY_TYPE_CURRENT),
        _ => None,
    }
}
