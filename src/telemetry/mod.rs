//! # Telemetry Module
//!
//! Delivery of decoded ESC telemetry.
//!
//! This module handles:
//! - The event type produced by a successful decode
//! - The sink capability a motor bus dispatches events to
//! - Writing events to rotating JSONL files

pub mod logger;

use serde::Serialize;

use crate::dshot::protocol::TelemetryKind;

/// One decoded telemetry reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    /// Bus-local channel index
    pub channel: usize,

    /// What the value measures
    pub kind: TelemetryKind,

    /// eRPM, volts, amps, degrees C or raw EDT value depending on `kind`
    pub value: i32,
}

/// Receiver of decoded telemetry, invoked synchronously from the bus cycle
pub trait TelemetrySink: Send {
    fn on_telemetry(&mut self, event: TelemetryEvent);
}

impl<F> TelemetrySink for F
where
    F: FnMut(TelemetryEvent) + Send,
{
    fn on_telemetry(&mut self, event: TelemetryEvent) {
        self(event)
    }
}

/// Sink that forwards every event into a channel, for consumers on another task
impl TelemetrySink for tokio::sync::mpsc::UnboundedSender<TelemetryEvent> {
    fn on_telemetry(&mut self, event: TelemetryEvent) {
        // Receiver gone means nobody is listening; the event is dropped like a lost frame
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let mut sink = move |event: TelemetryEvent| seen_clone.lock().unwrap().push(event);

        let event = TelemetryEvent {
            channel: 2,
            kind: TelemetryKind::Erpm,
            value: 12_000,
        };
        sink.on_telemetry(event);

        assert_eq!(*seen.lock().unwrap(), vec![event]);
    }

    #[test]
    fn test_channel_sink() {
        let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let event = TelemetryEvent {
            channel: 0,
            kind: TelemetryKind::Voltage,
            value: 16,
        };
        tx.on_telemetry(event);
        assert_eq!(rx.try_recv().unwrap(), event);

        drop(rx);
        tx.on_telemetry(event);
    }

    #[test]
    fn test_event_serializes_kind_in_snake_case() {
        let event = TelemetryEvent {
            channel: 1,
            kind: TelemetryKind::Temperature,
            value: 40,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"channel":1,"kind":"temperature","value":40}"#);
    }
}
