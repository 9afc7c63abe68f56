//! # DShot Checksums
//!
//! 4-bit checksums used by DShot frames and by the telemetry return frame.
//!
//! Both are the XOR of the nibbles above the checksum, inverted for
//! bidirectional DShot.

/// Checksum of a 12-bit frame value (payload << 1 | telemetry bit)
///
/// # Arguments
///
/// * `value` - 12-bit value that precedes the checksum nibble
///
/// # Returns
///
/// * `u16` - Inverted checksum nibble (0-15)
pub fn frame_crc(value: u16) -> u16 {
    !(value ^ (value >> 4) ^ (value >> 8)) & 0x0F
}

/// Checksum of a 16-bit telemetry frame, computed over its upper 12 bits
///
/// # Arguments
///
/// * `edt` - Decoded 16-bit telemetry frame, including the checksum nibble
///
/// # Returns
///
/// * `u16` - Expected checksum nibble (0-15)
pub fn telemetry_crc(edt: u16) -> u16 {
    !((edt >> 4) ^ (edt >> 8) ^ (edt >> 12)) & 0x0F
}

/// Check that a frame's checksum nibble matches the value above it
pub fn frame_crc_valid(frame: u16) -> bool {
    frame_crc(frame >> 4) == frame & 0x0F
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_crc_zero() {
        // XOR of nothing inverted
        assert_eq!(frame_crc(0), 0x0F);
    }

    #[test]
    fn test_frame_crc_known_value() {
        // payload 1046, no telemetry: value = 0x82C
        // 0x82C ^ 0x82 ^ 0x8 = 0x8A6 -> !0x6 & 0xF = 0x9
        assert_eq!(frame_crc(1046 << 1), 0x09);
    }

    #[test]
    fn test_telemetry_crc_matches_frame_crc() {
        // The telemetry checksum is the frame checksum applied to the upper 12 bits
        for value in [0u16, 0x123, 0x7FF, 0xABC, 0xFFF] {
            let edt = (value << 4) | frame_crc(value);
            assert_eq!(telemetry_crc(edt), edt & 0x0F);
        }
    }

    #[test]
    fn test_frame_crc_valid_detects_corruption() {
        let value = 0x5A5;
        let frame = (value << 4) | frame_crc(value);
        assert!(frame_crc_valid(frame));
        assert!(!frame_crc_valid(frame ^ 0x0001));
        assert!(!frame_crc_valid(frame ^ 0x0100));
    }
}
