//! Trait abstraction for the bit serializer that carries DShot frames.

use std::sync::OnceLock;
use std::time::Duration;

use crate::dshot::protocol::DshotSpeed;

/// Hardware shift engine driving one multiplexed DShot line group.
///
/// The engine transmits a frame, turns the line around and captures the ESC's
/// reply as one raw word per cycle.
#[cfg_attr(test, mockall::automock)]
pub trait TransportPort: Send {
    /// Install the serializer program and return its offset
    fn load_program(&mut self) -> u32;

    /// Configure the engine to run the program at `program_offset` at the given speed
    fn attach(&mut self, program_offset: u32, speed: DshotSpeed);

    /// Route the engine to a channel's pin
    fn select_channel(&mut self, channel: usize);

    /// True when the previous submission has been consumed
    fn is_ready(&self) -> bool;

    /// Queue one frame; the caller checks `is_ready` first
    fn submit(&mut self, frame: u16, bit_period_cycles: u32);

    /// Wait up to `timeout` for the word captured in this cycle.
    ///
    /// Returns 0 when nothing was captured.
    fn receive(&mut self, timeout: Duration) -> u32;
}

impl<T: TransportPort + ?Sized> TransportPort for Box<T> {
    fn load_program(&mut self) -> u32 {
        (**self).load_program()
    }

    fn attach(&mut self, program_offset: u32, speed: DshotSpeed) {
        (**self).attach(program_offset, speed)
    }

    fn select_channel(&mut self, channel: usize) {
        (**self).select_channel(channel)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn submit(&mut self, frame: u16, bit_period_cycles: u32) {
        (**self).submit(frame, bit_period_cycles)
    }

    fn receive(&mut self, timeout: Duration) -> u32 {
        (**self).receive(timeout)
    }
}

/// Program offset shared by every bus on the same serializer family.
///
/// The first bus to attach installs the program; later buses reuse the offset.
#[derive(Debug, Default)]
pub struct ProgramRegistry {
    offset: OnceLock<u32>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the installed program, installing it through `transport` if needed
    pub fn program_offset<T: TransportPort + ?Sized>(&self, transport: &mut T) -> u32 {
        *self.offset.get_or_init(|| transport.load_program())
    }

    /// Offset if a program has been installed
    pub fn installed(&self) -> Option<u32> {
        self.offset.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_loads_program_once() {
        let registry = ProgramRegistry::new();
        assert_eq!(registry.installed(), None);

        let mut first = MockTransportPort::new();
        first.expect_load_program().times(1).return_const(4u32);
        assert_eq!(registry.program_offset(&mut first), 4);

        let mut second = MockTransportPort::new();
        second.expect_load_program().times(0);
        assert_eq!(registry.program_offset(&mut second), 4);
        assert_eq!(registry.installed(), Some(4));
    }
}
