//! # DShot Bridge Library
//!
//! Drive several DShot ESCs from one bit serializer and bridge them to a host
//! computer over USB serial.
//!
//! This library provides the DShot frame codec, the GCR telemetry decoder, the
//! round-robin motor bus with command repetition and idle failsafe, and the
//! host link that carries throttles in and telemetry out.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod dshot;
pub mod error;
pub mod link;
pub mod serial;
pub mod telemetry;
