//! # DShot Protocol Module
//!
//! Implementation of the bidirectional DShot ESC protocol.
//!
//! This module handles:
//! - Throttle and command frame encoding (11-bit payload, 4-bit checksum)
//! - GCR telemetry decoding with error classification
//! - eRPM and extended telemetry (EDT) interpretation

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;
