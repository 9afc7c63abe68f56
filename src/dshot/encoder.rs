//! # DShot Frame Encoder
//!
//! Encodes throttle values and commands into 16-bit DShot frames.

use super::crc::frame_crc;
use super::protocol::*;

/// Encode an 11-bit payload and telemetry flag into a complete frame
///
/// # Arguments
///
/// * `payload` - 11-bit payload (0-2047); higher bits are discarded
/// * `telemetry` - Telemetry/command bit
///
/// # Returns
///
/// * `u16` - Frame laid out as `payload(11) | telemetry(1) | crc(4)`
///
/// # Examples
///
/// ```
/// use dshot_bridge::dshot::encoder::encode_frame;
///
/// let frame = encode_frame(0, false);
/// assert_eq!(frame, 0x000F);
/// ```
pub fn encode_frame(payload: u16, telemetry: bool) -> u16 {
    let value = ((payload & DSHOT_PAYLOAD_MAX) << 1) | telemetry as u16;
    (value << 4) | frame_crc(value)
}

/// Encode a throttle frame (telemetry bit clear, 0 = neutral)
pub fn throttle_frame(throttle: u16) -> u16 {
    encode_frame(throttle, false)
}

/// Encode a command frame (telemetry bit set)
pub fn command_frame(command: u16) -> u16 {
    encode_frame(command, true)
}

/// Frame as loaded into the serializer FIFO.
///
/// The line idles high, so the frame goes out inverted and left-aligned in
/// the 32-bit word that the serializer shifts out MSB first.
pub fn wire_word(frame: u16) -> u32 {
    (!frame as u32) << 16
}

/// Recover the frame carried by a serializer FIFO word
pub fn frame_from_wire_word(word: u32) -> u16 {
    !((word >> 16) as u16)
}

/// Payload (upper 11 bits) of a frame
pub fn frame_payload(frame: u16) -> u16 {
    frame >> 5
}

/// Telemetry/command bit of a frame
pub fn frame_telemetry_bit(frame: u16) -> bool {
    frame & 0x10 != 0
}
