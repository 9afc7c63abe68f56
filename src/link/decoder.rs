//! # Host Throttle Packet Decoder
//!
//! Streaming parser for inbound throttle packets.

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::protocol::*;

/// Reassembles throttle packets from an arbitrary split byte stream.
///
/// Bytes before a start byte are skipped. A complete packet with a bad
/// checksum is dropped and the parser waits for the next start byte.
#[derive(Debug)]
pub struct InputParser {
    num_motors: usize,
    buffer: BytesMut,
    checksum_errors: u64,
    packets: u64,
}

impl InputParser {
    /// Create a parser for packets carrying `num_motors` throttle values
    pub fn new(num_motors: usize) -> Self {
        Self {
            num_motors,
            buffer: BytesMut::with_capacity(input_packet_size(num_motors)),
            checksum_errors: 0,
            packets: 0,
        }
    }

    /// Feed received bytes
    ///
    /// # Returns
    ///
    /// * `Vec<Vec<u16>>` - Host throttle values of every valid packet completed by `data`
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u16>> {
        let size = input_packet_size(self.num_motors);
        let mut packets = Vec::new();

        for &byte in data {
            if self.buffer.is_empty() && byte != INPUT_START_BYTE {
                continue;
            }

            self.buffer.extend_from_slice(&[byte]);
            if self.buffer.len() < size {
                continue;
            }

            let mut packet = self.buffer.split_to(size);
            let received = packet[size - 1];
            let calculated = xor_checksum(&packet[..size - 1]);

            if received != calculated {
                debug!(
                    "Dropping host packet: checksum 0x{:02X}, expected 0x{:02X}",
                    received, calculated
                );
                self.checksum_errors += 1;
                continue;
            }

            packet.advance(1);
            let throttles = (0..self.num_motors).map(|_| packet.get_u16_le()).collect();
            self.packets += 1;
            packets.push(throttles);
        }

        packets
    }

    /// Discard a partially received packet
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes of the packet currently being assembled
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Packets dropped for a bad checksum
    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    /// Valid packets decoded
    pub fn packets(&self) -> u64 {
        self.packets
    }
}

/// Build an inbound packet; the host side of the link
pub fn encode_input_packet(throttles: &[u16]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(input_packet_size(throttles.len()));
    packet.push(INPUT_START_BYTE);
    for &throttle in throttles {
        packet.extend_from_slice(&throttle.to_le_bytes());
    }
    packet.push(xor_checksum(&packet));
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_packet() {
        let mut parser = InputParser::new(4);
        let packet = encode_input_packet(&[1000, 1500, 500, 2000]);
        assert_eq!(packet.len(), 10);

        let decoded = parser.feed(&packet);
        assert_eq!(decoded, vec![vec![1000, 1500, 500, 2000]]);
        assert_eq!(parser.pending(), 0);
        assert_eq!(parser.packets(), 1);
    }

    #[test]
    fn test_packet_split_across_reads() {
        let mut parser = InputParser::new(2);
        let packet = encode_input_packet(&[1200, 800]);

        assert!(parser.feed(&packet[..3]).is_empty());
        assert_eq!(parser.pending(), 3);
        assert_eq!(parser.feed(&packet[3..]), vec![vec![1200, 800]]);
    }

    #[test]
    fn test_skips_garbage_before_start_byte() {
        let mut parser = InputParser::new(1);
        let mut data = vec![0x00, 0xFF, 0x13];
        data.extend(encode_input_packet(&[1234]));

        assert_eq!(parser.feed(&data), vec![vec![1234]]);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut parser = InputParser::new(2);
        let mut packet = encode_input_packet(&[1100, 900]);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;

        assert!(parser.feed(&packet).is_empty());
        assert_eq!(parser.checksum_errors(), 1);
        assert_eq!(parser.pending(), 0);

        let good = encode_input_packet(&[1100, 900]);
        assert_eq!(parser.feed(&good), vec![vec![1100, 900]]);
    }

    #[test]
    fn test_back_to_back_packets() {
        let mut parser = InputParser::new(1);
        let mut data = encode_input_packet(&[1000]);
        data.extend(encode_input_packet(&[1001]));

        assert_eq!(parser.feed(&data), vec![vec![1000], vec![1001]]);
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut parser = InputParser::new(2);
        let packet = encode_input_packet(&[1, 2]);
        parser.feed(&packet[..2]);
        parser.reset();
        assert_eq!(parser.pending(), 0);
        assert!(parser.feed(&packet[2..]).is_empty());
    }
}
