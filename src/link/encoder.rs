//! # Host Telemetry Packet Encoder
//!
//! Encodes decoded ESC telemetry into packets for the host.

use super::protocol::*;
use crate::dshot::protocol::TelemetryKind;

/// Encode one telemetry reading into an 8-byte host packet
///
/// # Arguments
///
/// * `motor` - Global motor id
/// * `kind` - Telemetry kind
/// * `value` - Decoded value (voltage in whole volts as decoded)
///
/// # Returns
///
/// * `Option<[u8; 8]>` - Packet, or `None` for kinds the host link does not carry
///
/// Voltage goes out as the ESC's raw quarter-volt count.
///
/// # Examples
///
/// ```
/// use dshot_bridge::dshot::protocol::TelemetryKind;
/// use dshot_bridge::link::encoder::encode_telemetry_packet;
///
/// let packet = encode_telemetry_packet(2, TelemetryKind::Erpm, 12_000).unwrap();
/// assert_eq!(packet[0], 0xA5);
/// assert_eq!(packet[1], 2);
/// ```
pub fn encode_telemetry_packet(motor: u8, kind: TelemetryKind, value: i32) -> Option<[u8; TELEMETRY_PACKET_SIZE]> {
    let type_code = telemetry_type_code(kind)?;
    let value = match kind {
        TelemetryKind::Voltage => value.wrapping_mul(4),
        _ => value,
    };

    let mut packet = [0u8; TELEMETRY_PACKET_SIZE];
    packet[0] = TELEMETRY_START_BYTE;
    packet[1] = motor;
    packet[2] = type_code;
    packet[3..7].copy_from_slice(&value.to_le_bytes());
    packet[TELEMETRY_PACKET_SIZE - 1] = xor_checksum(&packet[..TELEMETRY_PACKET_SIZE - 1]);

    Some(packet)
}
