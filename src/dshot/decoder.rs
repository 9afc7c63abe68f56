//! # DShot Telemetry Decoder
//!
//! Decodes the ESC's GCR-encoded return frame into eRPM or extended
//! telemetry (EDT) values.
//!
//! The serializer captures the return line as a transition-coded word: a bit
//! flips wherever the line level changed. Undoing that gives four 5-bit GCR
//! groups, each carrying one nibble of a 16-bit frame with a trailing checksum.

use super::crc::telemetry_crc;
use super::protocol::*;
use crate::error::TelemetryError;

/// GCR codewords indexed by the nibble they carry
pub const GCR_CODEWORDS: [u8; 16] = [
    0x19, 0x1B, 0x12, 0x13, 0x1D, 0x15, 0x16, 0x17, 0x1A, 0x09, 0x0A, 0x0B, 0x1E, 0x0D, 0x0E,
    0x0F,
];

/// Marker for 5-bit values that are not GCR codewords
const GCR_INVALID: u8 = 0xFF;

/// GCR decode table: 5-bit codeword -> nibble
const GCR_DECODE: [u8; 32] = generate_gcr_decode_table();

/// Invert the codeword table at compile time
const fn generate_gcr_decode_table() -> [u8; 32] {
    let mut table = [GCR_INVALID; 32];
    let mut nibble = 0;

    while nibble < 16 {
        table[GCR_CODEWORDS[nibble] as usize] = nibble as u8;
        nibble += 1;
    }

    table
}

/// Look up the nibble carried by a 5-bit GCR group
///
/// # Returns
///
/// * `Option<u8>` - Nibble value, or `None` if `group` is not a codeword
pub fn gcr_nibble(group: u8) -> Option<u8> {
    match GCR_DECODE.get(group as usize) {
        Some(&nibble) if nibble != GCR_INVALID => Some(nibble),
        _ => None,
    }
}

/// Decode a raw captured word into a telemetry value
///
/// # Arguments
///
/// * `raw` - Word captured by the serializer during the listen window
///
/// # Returns
///
/// * `Result<(TelemetryKind, i32), TelemetryError>` - Decoded reading
///
/// # Errors
///
/// - `Timeout` if nothing was captured (`raw == 0`)
/// - `BadGcr` if any of the four groups is not a codeword
/// - `BadCrc` if the frame checksum does not match
/// - `BadType` if the frame is EDT with an unassigned prefix
pub fn decode_telemetry(raw: u32) -> Result<(TelemetryKind, i32), TelemetryError> {
    if raw == 0 {
        return Err(TelemetryError::Timeout);
    }

    let edt = gcr_to_frame(raw ^ (raw >> 1))?;

    if telemetry_crc(edt) != edt & 0x0F {
        return Err(TelemetryError::BadCrc);
    }

    classify(edt)
}

/// Assemble the 16-bit frame from four GCR groups, MSB first
fn gcr_to_frame(gcr: u32) -> Result<u16, TelemetryError> {
    let mut nibbles = [0u8; 4];

    for (nibble, shift) in nibbles.iter_mut().zip([15u32, 10, 5, 0]) {
        *nibble = gcr_nibble(((gcr >> shift) & 0x1F) as u8).ok_or(TelemetryError::BadGcr)?;
    }

    Ok(nibbles
        .iter()
        .fold(0u16, |edt, &nibble| (edt << 4) | nibble as u16))
}

/// Classify a checksummed frame by its top nibble.
///
/// A nonzero even prefix marks extended telemetry with an 8-bit value; anything
/// else is a 3-bit exponent and 9-bit mantissa encoding the commutation period.
fn classify(edt: u16) -> Result<(TelemetryKind, i32), TelemetryError> {
    let top = (edt >> 12) & 0x0F;

    if top == 0 || top & 0x1 != 0 {
        return Ok((TelemetryKind::Erpm, period_to_erpm(edt)));
    }

    let m = ((edt >> 4) & 0xFF) as i32;
    let reading = match top {
        0x2 => (TelemetryKind::Temperature, m),
        0x4 => (TelemetryKind::Voltage, m / 4),
        0x6 => (TelemetryKind::Current, m),
        0x8 => (TelemetryKind::Debug1, m),
        0xA => (TelemetryKind::Debug2, m),
        0xC => (TelemetryKind::Stress, m),
        0xE => (TelemetryKind::Status, m),
        _ => return Err(TelemetryError::BadType),
    };

    Ok(reading)
}

/// Convert an eRPM telemetry frame to electrical RPM
fn period_to_erpm(edt: u16) -> i32 {
    let e = (edt >> 13) & 0x7;
    let m = ((edt >> 4) & 0x1FF) as u32;
    erpm_from_period(m << e)
}

/// Convert a commutation period in microseconds to electrical RPM
///
/// A stopped motor reports `0xFF80`; both it and a zero period read as 0.
pub fn erpm_from_period(period_us: u32) -> i32 {
    match period_us {
        DSHOT_ERPM_PERIOD_STOPPED | 0 => 0,
        period => (DSHOT_ERPM_PERIOD_SCALE / period) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{encode_reply, erpm_reply_frame, transition_encode};

    /// Build a checksummed telemetry frame from its upper 12 bits
    fn frame(upper: u16) -> u16 {
        (upper << 4) | telemetry_crc(upper << 4)
    }

    #[test]
    fn test_zero_is_timeout() {
        assert_eq!(decode_telemetry(0), Err(TelemetryError::Timeout));
    }

    #[test]
    fn test_gcr_table_is_bijective() {
        let mut seen = [false; 16];
        for group in 0u8..32 {
            if let Some(nibble) = gcr_nibble(group) {
                assert!(!seen[nibble as usize], "nibble {} mapped twice", nibble);
                seen[nibble as usize] = true;
                assert_eq!(GCR_CODEWORDS[nibble as usize], group);
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_non_codewords_are_rejected() {
        let valid: Vec<u8> = GCR_CODEWORDS.to_vec();
        let invalid = (0u8..32).filter(|g| !valid.contains(g)).count();
        assert_eq!(invalid, 16);
        for group in (0u8..32).filter(|g| !valid.contains(g)) {
            assert_eq!(gcr_nibble(group), None, "group 0x{:02X}", group);
        }
        assert_eq!(gcr_nibble(32), None);
    }

    #[test]
    fn test_bad_gcr_in_any_group() {
        let raw = encode_reply(frame(0x123));
        assert!(decode_telemetry(raw).is_ok());

        // 0x00 is never a codeword; plant it in each group in turn
        let gcr = raw ^ (raw >> 1);
        for shift in [15u32, 10, 5, 0] {
            let corrupted_gcr = gcr & !(0x1F << shift);
            let corrupted_raw = transition_encode(corrupted_gcr);
            assert_eq!(
                decode_telemetry(corrupted_raw),
                Err(TelemetryError::BadGcr),
                "group at shift {}",
                shift
            );
        }
    }

    #[test]
    fn test_bad_crc() {
        let good = frame(0x123);
        let raw = encode_reply(good ^ 0x0001);
        assert_eq!(decode_telemetry(raw), Err(TelemetryError::BadCrc));
    }

    #[test]
    fn test_erpm_period_1000() {
        // 1000 = 500 << 1, mantissa normalized so the prefix stays odd
        let raw = encode_reply(frame((1 << 9) | 500));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 60_000)));
    }

    #[test]
    fn test_erpm_stopped_sentinel() {
        // 0xFF80 = 0x1FF << 7
        let raw = encode_reply(frame((7 << 9) | 0x1FF));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 0)));
    }

    #[test]
    fn test_erpm_zero_period() {
        let raw = encode_reply(frame(0));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 0)));
    }

    #[test]
    fn test_erpm_odd_prefix_is_legacy() {
        // top nibble 0x3: e = 1, m = 0x100 -> period 512
        let raw = encode_reply(frame(0x300));
        assert_eq!(
            decode_telemetry(raw),
            Ok((TelemetryKind::Erpm, (60_000_000 / 512) as i32))
        );
    }

    #[test]
    fn test_erpm_reply_frame_helper() {
        let raw = encode_reply(erpm_reply_frame(2000));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Erpm, 30_000)));
    }

    #[test]
    fn test_extended_telemetry_prefixes() {
        let cases = [
            (0x2, TelemetryKind::Temperature, 45),
            (0x6, TelemetryKind::Current, 12),
            (0x8, TelemetryKind::Debug1, 200),
            (0xA, TelemetryKind::Debug2, 7),
            (0xC, TelemetryKind::Stress, 99),
            (0xE, TelemetryKind::Status, 0x81),
        ];

        for (prefix, kind, value) in cases {
            let raw = encode_reply(frame((prefix << 8) | value as u16));
            assert_eq!(decode_telemetry(raw), Ok((kind, value)), "prefix 0x{:X}", prefix);
        }
    }

    #[test]
    fn test_voltage_is_quarter_volts() {
        // 0x64 = 100 quarter-volt units -> 25
        let raw = encode_reply(frame(0x464));
        assert_eq!(decode_telemetry(raw), Ok((TelemetryKind::Voltage, 25)));
    }

    #[test]
    fn test_erpm_from_period() {
        assert_eq!(erpm_from_period(0xFF80), 0);
        assert_eq!(erpm_from_period(0), 0);
        assert_eq!(erpm_from_period(1000), 60_000);
        assert_eq!(erpm_from_period(7), 8_571_428);
        assert_eq!(erpm_from_period(0xFF7F), (60_000_000u32 / 0xFF7F) as i32);
    }
}
