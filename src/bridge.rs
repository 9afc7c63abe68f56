//! # Bridge Module
//!
//! Connects host throttle packets to the motor buses.
//!
//! This module handles:
//! - Numbering motors across buses (global id = group base + channel)
//! - The startup command sequence
//! - Host link supervision and 3D throttle translation
//! - Extended telemetry activation while all motors are at neutral

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{min_command_repeat, ChannelStats, Clock, MotorBus, TransportPort};
use crate::config::{SafetyConfig, StartupCommand};
use crate::dshot::protocol::{Command, TelemetryKind};
use crate::error::{DshotBridgeError, Result};
use crate::link::protocol::{translate_throttle, HOST_THROTTLE_NEUTRAL};
use crate::telemetry::TelemetryEvent;

/// Repetitions of the extended telemetry enable command
pub const EDT_ENABLE_REPEAT: u8 = 6;

/// Control loop period assumed until told otherwise
pub const DEFAULT_LOOP_PERIOD: Duration = Duration::from_millis(1);

/// A motor bus behind its exclusive lock
pub type SharedBus<T, C> = Arc<Mutex<MotorBus<T, C>>>;

/// Telemetry reading addressed by global motor id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorTelemetry {
    pub motor: usize,
    pub kind: TelemetryKind,
    pub value: i32,
}

#[derive(Debug)]
struct MotorGroup<T: TransportPort, C: Clock> {
    base: usize,
    bus: SharedBus<T, C>,
}

#[derive(Debug, Clone)]
struct MotorState {
    group: usize,
    channel: usize,
    host_throttle: u16,
    applied: Option<u16>,
    last_telemetry: Option<Instant>,
    edt_active: bool,
    edt_requested: Option<Instant>,
}

fn lock<T: TransportPort, C: Clock>(bus: &SharedBus<T, C>) -> MutexGuard<'_, MotorBus<T, C>> {
    // A panic on another thread must not stop the motors from being driven
    bus.lock().unwrap_or_else(|e| e.into_inner())
}

/// Control loop state for every motor on every bus
#[derive(Debug)]
pub struct Bridge<T: TransportPort, C: Clock> {
    groups: Vec<MotorGroup<T, C>>,
    motors: Vec<MotorState>,
    clock: C,
    loop_period: Duration,
    comm_timeout: Duration,
    edt_timeout: Duration,
    last_host_packet: Option<Instant>,
    link_lost: bool,
    startup: VecDeque<StartupCommand>,
    startup_active: bool,
    events: Receiver<MotorTelemetry>,
}

impl<T: TransportPort, C: Clock> Bridge<T, C> {
    /// Take ownership of `buses`, numbering their motors in order
    ///
    /// Each bus gets a telemetry sink that tags events with the global motor id.
    pub fn new(buses: Vec<MotorBus<T, C>>, clock: C, safety: &SafetyConfig) -> Self {
        let (tx, events) = mpsc::channel();
        let mut groups = Vec::with_capacity(buses.len());
        let mut motors = Vec::new();

        for (group, mut bus) in buses.into_iter().enumerate() {
            let base = motors.len();
            let tx = tx.clone();
            bus.set_sink(move |event: TelemetryEvent| {
                // Receiver lives as long as the bridge
                let _ = tx.send(MotorTelemetry {
                    motor: base + event.channel,
                    kind: event.kind,
                    value: event.value,
                });
            });

            for channel in 0..bus.num_channels() {
                motors.push(MotorState {
                    group,
                    channel,
                    host_throttle: HOST_THROTTLE_NEUTRAL,
                    applied: None,
                    last_telemetry: None,
                    edt_active: false,
                    edt_requested: None,
                });
            }

            groups.push(MotorGroup {
                base,
                bus: Arc::new(Mutex::new(bus)),
            });
        }

        info!("Bridge driving {} motors on {} buses", motors.len(), groups.len());

        Self {
            groups,
            motors,
            clock,
            loop_period: DEFAULT_LOOP_PERIOD,
            comm_timeout: safety.comm_timeout(),
            edt_timeout: safety.edt_timeout(),
            last_host_packet: None,
            link_lost: false,
            startup: VecDeque::new(),
            startup_active: false,
            events,
        }
    }

    /// Set the period [`tick`](Self::tick) is called at
    pub fn with_loop_period(mut self, loop_period: Duration) -> Self {
        self.loop_period = loop_period;
        self
    }

    /// Queue commands to send to every motor before host throttles take over.
    ///
    /// Each command is issued once the previous one has settled on every channel.
    pub fn queue_startup(&mut self, commands: &[StartupCommand]) {
        self.startup.extend(commands.iter().copied());
        self.startup_active = !self.startup.is_empty();
    }

    /// Whether the startup sequence still owns the buses
    pub fn in_startup(&self) -> bool {
        self.startup_active
    }

    /// Record a valid host packet of raw host throttle values
    ///
    /// # Errors
    ///
    /// Returns `LinkProtocol` if the packet does not carry one value per motor;
    /// the packet is then ignored and does not count as link activity
    pub fn set_host_throttles(&mut self, values: &[u16]) -> Result<()> {
        if values.len() != self.motors.len() {
            return Err(DshotBridgeError::LinkProtocol(format!(
                "host packet carries {} throttles for {} motors",
                values.len(),
                self.motors.len()
            )));
        }

        for (motor, &value) in self.motors.iter_mut().zip(values) {
            motor.host_throttle = value;
        }

        self.last_host_packet = Some(self.clock.now());
        if self.link_lost {
            info!("Host link restored");
            self.link_lost = false;
        }
        Ok(())
    }

    /// Run one control tick and return the telemetry it produced
    pub fn tick(&mut self) -> Vec<MotorTelemetry> {
        let now = self.clock.now();

        if !self.advance_startup() {
            self.check_host_link(now);
            self.apply_host_throttles();
            self.request_edt(now);
        }

        self.cycle_all();
        self.drain_events(now)
    }

    fn advance_startup(&mut self) -> bool {
        if !self.startup_active {
            return false;
        }

        if !self.all_settled() {
            return true;
        }

        let Some(startup) = self.startup.pop_front() else {
            info!("Startup sequence complete");
            self.startup_active = false;
            return false;
        };

        info!(
            "Startup: {:?} x{} on all motors",
            startup.command, startup.repeat
        );
        for (group, entry) in self.groups.iter().enumerate() {
            let mut bus = lock(&entry.bus);
            let repeat = self.startup_repeat(startup, bus.num_channels());
            if repeat != startup.repeat {
                debug!(
                    "Bus {}: {:?} repeat raised to {} to outlast its delay",
                    group, startup.command, repeat
                );
            }
            for channel in 0..bus.num_channels() {
                bus.send(channel, startup.command, repeat);
            }
        }
        true
    }

    /// Configured repeat, raised so the command still goes out on a bus this size
    fn startup_repeat(&self, startup: StartupCommand, num_channels: usize) -> u8 {
        let needed = min_command_repeat(startup.command.value(), num_channels, self.loop_period);
        let needed = u8::try_from(needed).unwrap_or(u8::MAX);
        startup.repeat.max(needed)
    }

    fn check_host_link(&mut self, now: Instant) {
        let Some(last) = self.last_host_packet else {
            return;
        };

        if !self.link_lost && now.duration_since(last) > self.comm_timeout {
            warn!(
                "No host packet for {:?}, holding all motors at neutral",
                self.comm_timeout
            );
            self.link_lost = true;
            for motor in &mut self.motors {
                motor.host_throttle = HOST_THROTTLE_NEUTRAL;
            }
        }
    }

    fn apply_host_throttles(&mut self) {
        for motor in &mut self.motors {
            let throttle = translate_throttle(motor.host_throttle);
            let mut bus = lock(&self.groups[motor.group].bus);

            // An unchanged throttle must not cut a pending command short
            if motor.applied != Some(throttle) || bus.is_settled(motor.channel) {
                bus.set_throttle(motor.channel, throttle);
                motor.applied = Some(throttle);
            }
        }
    }

    fn request_edt(&mut self, now: Instant) {
        for (id, motor) in self.motors.iter_mut().enumerate() {
            if motor.edt_active {
                if let Some(last) = motor.last_telemetry {
                    if now.duration_since(last) > self.edt_timeout {
                        debug!("Motor {}: no telemetry for {:?}, EDT inactive", id, self.edt_timeout);
                        motor.edt_active = false;
                    }
                }
            }
        }

        if self.motors.iter().any(|m| m.host_throttle != HOST_THROTTLE_NEUTRAL) {
            return;
        }

        for (id, motor) in self.motors.iter_mut().enumerate() {
            if motor.edt_active {
                continue;
            }

            let recently_requested = motor
                .edt_requested
                .map(|at| now.duration_since(at) < self.edt_timeout)
                .unwrap_or(false);
            if recently_requested {
                continue;
            }

            let mut bus = lock(&self.groups[motor.group].bus);
            if bus.is_settled(motor.channel) {
                debug!("Motor {}: requesting extended telemetry", id);
                bus.send(motor.channel, Command::ExtendedTelemetryEnable, EDT_ENABLE_REPEAT);
                motor.edt_requested = Some(now);
            }
        }
    }

    fn cycle_all(&self) {
        for group in &self.groups {
            lock(&group.bus).run_cycle();
        }
    }

    fn drain_events(&mut self, now: Instant) -> Vec<MotorTelemetry> {
        let events: Vec<MotorTelemetry> = self.events.try_iter().collect();

        for event in &events {
            let Some(motor) = self.motors.get_mut(event.motor) else {
                continue;
            };
            motor.last_telemetry = Some(now);

            if event.kind == TelemetryKind::Status && !motor.edt_active {
                info!("Motor {}: extended telemetry active", event.motor);
                motor.edt_active = true;
            }
        }

        events
    }

    /// Every channel on every bus has no pending command or delay
    pub fn all_settled(&self) -> bool {
        self.groups.iter().all(|g| lock(&g.bus).all_settled())
    }

    /// Total motors across all buses
    pub fn num_motors(&self) -> usize {
        self.motors.len()
    }

    /// Global id of the first motor of each bus
    pub fn group_bases(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.base).collect()
    }

    /// Shared handle to one bus
    pub fn bus(&self, group: usize) -> Option<SharedBus<T, C>> {
        self.groups.get(group).map(|g| Arc::clone(&g.bus))
    }

    /// Bus index and channel of a global motor id
    pub fn locate(&self, motor: usize) -> Option<(usize, usize)> {
        self.motors.get(motor).map(|m| (m.group, m.channel))
    }

    /// Last raw host throttle for a motor (neutral after a link timeout)
    pub fn host_throttle(&self, motor: usize) -> Option<u16> {
        self.motors.get(motor).map(|m| m.host_throttle)
    }

    /// Whether a motor is currently sending extended telemetry
    pub fn edt_active(&self, motor: usize) -> bool {
        self.motors.get(motor).map(|m| m.edt_active).unwrap_or(false)
    }

    /// Receive statistics of a global motor id
    pub fn stats(&self, motor: usize) -> Option<ChannelStats> {
        let (group, channel) = self.locate(motor)?;
        lock(&self.groups[group].bus).stats(channel)
    }

    /// Whether the host link has timed out
    pub fn link_lost(&self) -> bool {
        self.link_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimulatedEsc;
    use crate::bus::{ManualClock, ProgramRegistry};
    use crate::dshot::encoder::frame_payload;
    use crate::dshot::protocol::DshotSpeed;

    fn build(groups: &[usize]) -> (Bridge<SimulatedEsc, ManualClock>, Vec<SimulatedEsc>, ManualClock) {
        let clock = ManualClock::new();
        let registry = ProgramRegistry::new();
        let mut sims = Vec::new();
        let mut buses = Vec::new();

        for &channels in groups {
            let sim = SimulatedEsc::new(channels);
            sims.push(sim.clone());
            buses.push(
                MotorBus::new(channels, DshotSpeed::DShot300, sim, clock.clone(), &registry).unwrap(),
            );
        }

        let bridge = Bridge::new(buses, clock.clone(), &SafetyConfig::default());
        (bridge, sims, clock)
    }

    fn run(bridge: &mut Bridge<SimulatedEsc, ManualClock>, clock: &ManualClock, ticks: usize) -> Vec<MotorTelemetry> {
        let mut events = Vec::new();
        for _ in 0..ticks {
            events.extend(bridge.tick());
            clock.advance(Duration::from_millis(1));
        }
        events
    }

    #[test]
    fn test_wrong_length_packet_rejected() {
        let (mut bridge, _, _) = build(&[2]);
        assert!(matches!(
            bridge.set_host_throttles(&[1500]),
            Err(DshotBridgeError::LinkProtocol(_))
        ));
        assert_eq!(bridge.host_throttle(0), Some(HOST_THROTTLE_NEUTRAL));
    }

    #[test]
    fn test_global_numbering() {
        let (bridge, _, _) = build(&[4, 2]);
        assert_eq!(bridge.num_motors(), 6);
        assert_eq!(bridge.group_bases(), vec![0, 4]);
        assert_eq!(bridge.locate(5), Some((1, 1)));
        assert_eq!(bridge.locate(6), None);
    }

    #[test]
    fn test_host_throttles_reach_escs() {
        let (mut bridge, sims, clock) = build(&[2, 2]);
        bridge.set_host_throttles(&[2000, 1000, 0, 1500]).unwrap();
        run(&mut bridge, &clock, 4);

        assert_eq!(sims[0].esc(0).unwrap().throttle, 2047);
        assert_eq!(sims[0].esc(1).unwrap().throttle, 0);
        assert_eq!(sims[1].esc(0).unwrap().throttle, 1047);
        assert_eq!(sims[1].esc(1).unwrap().throttle, 1547);
    }

    #[test]
    fn test_telemetry_tagged_with_global_id() {
        let (mut bridge, _, clock) = build(&[1, 1]);
        bridge.set_host_throttles(&[1500, 1500]).unwrap();

        let events = run(&mut bridge, &clock, 3);
        assert!(events.iter().any(|e| e.motor == 0 && e.kind == TelemetryKind::Erpm));
        assert!(events.iter().any(|e| e.motor == 1 && e.kind == TelemetryKind::Erpm));
    }

    #[test]
    fn test_comm_timeout_forces_neutral() {
        let (mut bridge, sims, clock) = build(&[1]);
        bridge.set_host_throttles(&[1800]).unwrap();
        run(&mut bridge, &clock, 2);
        assert_eq!(sims[0].esc(0).unwrap().throttle, 1847);

        clock.advance(Duration::from_millis(250));
        run(&mut bridge, &clock, 8);

        assert!(bridge.link_lost());
        assert_eq!(bridge.host_throttle(0), Some(HOST_THROTTLE_NEUTRAL));
        assert_eq!(sims[0].esc(0).unwrap().throttle, 0);

        bridge.set_host_throttles(&[1200]).unwrap();
        assert!(!bridge.link_lost());
    }

    #[test]
    fn test_startup_sequence_runs_in_order() {
        let (mut bridge, sims, clock) = build(&[2]);
        bridge.queue_startup(&[
            StartupCommand { command: Command::ThreeDModeOn, repeat: 3 },
            StartupCommand { command: Command::Beep1, repeat: 3 },
        ]);
        bridge.set_host_throttles(&[1500, 1500]).unwrap();
        assert!(bridge.in_startup());

        let mut seen = Vec::new();
        for _ in 0..40 {
            bridge.tick();
            clock.advance(Duration::from_millis(1));
            for s in sims[0].submissions() {
                let payload = frame_payload(s.frame);
                if seen.last() != Some(&payload) {
                    seen.push(payload);
                }
            }
            sims[0].clear_submissions();
        }

        let three_d = seen.iter().position(|&p| p == Command::ThreeDModeOn.value());
        let beep = seen.iter().position(|&p| p == Command::Beep1.value());
        assert!(three_d.is_some() && beep.is_some());
        assert!(three_d < beep);
        assert!(!bridge.in_startup());
        assert_eq!(sims[0].esc(0).unwrap().throttle, 1547);
    }

    /// Run the startup sequence to completion, counting SaveSettings frames
    /// per bus and channel
    fn count_saves(
        bridge: &mut Bridge<SimulatedEsc, ManualClock>,
        sims: &[SimulatedEsc],
        clock: &ManualClock,
        period: Duration,
    ) -> Vec<Vec<usize>> {
        let mut counts: Vec<Vec<usize>> = sims
            .iter()
            .map(|sim| vec![0; sim.esc_count()])
            .collect();

        for _ in 0..2000 {
            if !bridge.in_startup() {
                break;
            }
            bridge.tick();
            clock.advance(period);
            for (bus, sim) in sims.iter().enumerate() {
                for s in sim.submissions() {
                    if frame_payload(s.frame) == Command::SaveSettings.value() {
                        counts[bus][s.channel] += 1;
                    }
                }
                sim.clear_submissions();
            }
        }
        counts
    }

    #[test]
    fn test_default_startup_saves_settings_on_every_channel() {
        let config = crate::config::Config::from_toml(include_str!("../config/default.toml")).unwrap();
        let clock = ManualClock::new();
        let registry = ProgramRegistry::new();
        let sims: Vec<SimulatedEsc> = config.dshot.groups.iter().map(|&n| SimulatedEsc::new(n)).collect();
        let buses = sims
            .iter()
            .zip(&config.dshot.groups)
            .map(|(sim, &n)| MotorBus::new(n, config.dshot.speed, sim.clone(), clock.clone(), &registry).unwrap())
            .collect();

        let mut bridge = Bridge::new(buses, clock.clone(), &config.safety)
            .with_loop_period(config.dshot.loop_period());
        bridge.queue_startup(&config.startup.commands);

        let counts = count_saves(&mut bridge, &sims, &clock, config.dshot.loop_period());

        assert!(!bridge.in_startup());
        for (bus, channels) in counts.iter().enumerate() {
            for (channel, &saves) in channels.iter().enumerate() {
                assert!(saves >= 1, "bus {} channel {} never saw SaveSettings", bus, channel);
            }
        }
    }

    #[test]
    fn test_short_startup_repeat_raised_to_outlast_delay() {
        let (bridge, sims, clock) = build(&[1, 3]);
        let mut bridge = bridge.with_loop_period(Duration::from_millis(1));
        bridge.queue_startup(&[StartupCommand { command: Command::SaveSettings, repeat: 2 }]);

        let counts = count_saves(&mut bridge, &sims, &clock, Duration::from_millis(1));

        assert!(!bridge.in_startup());
        assert!(counts.iter().flatten().all(|&saves| saves >= 1), "{:?}", counts);
    }

    #[test]
    fn test_edt_requested_at_neutral_and_activated_by_status() {
        let (mut bridge, sims, clock) = build(&[1]);
        bridge.set_host_throttles(&[1000]).unwrap();

        run(&mut bridge, &clock, 10);
        assert!(sims[0].esc(0).unwrap().edt_enabled);

        // Keep the host link alive until a status frame comes back
        for _ in 0..10 {
            bridge.set_host_throttles(&[1000]).unwrap();
            run(&mut bridge, &clock, 10);
        }
        assert!(bridge.edt_active(0));
    }

    #[test]
    fn test_edt_not_requested_while_moving() {
        let (mut bridge, sims, clock) = build(&[2]);
        bridge.set_host_throttles(&[1000, 1300]).unwrap();
        run(&mut bridge, &clock, 20);

        assert!(!sims[0].esc(0).unwrap().edt_enabled);
        assert!(!sims[0].esc(1).unwrap().edt_enabled);
    }

    #[test]
    fn test_edt_expires_without_telemetry() {
        let (mut bridge, sims, clock) = build(&[1]);
        for _ in 0..10 {
            bridge.set_host_throttles(&[1000]).unwrap();
            run(&mut bridge, &clock, 10);
        }
        assert!(bridge.edt_active(0));

        sims[0].set_silent(true);
        clock.advance(Duration::from_millis(1100));
        bridge.set_host_throttles(&[1000]).unwrap();
        run(&mut bridge, &clock, 1);
        assert!(!bridge.edt_active(0));
    }
}
