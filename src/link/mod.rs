//! # Host Link Module
//!
//! Byte protocol spoken with the host over the serial port.
//!
//! This module handles:
//! - Parsing inbound throttle packets (start byte, little-endian values, XOR checksum)
//! - Translating the host's 3D throttle scale to DShot payloads
//! - Encoding outbound telemetry packets

pub mod protocol;
pub mod encoder;
pub mod decoder;
