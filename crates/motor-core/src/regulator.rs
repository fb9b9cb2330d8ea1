use crate::config::{MotorConfig, RegulatorConfig};
use crate::error::DeviceIoError;
use crate::hal::{DeviceChannel, MotorCommand, Polarity, StopAction};
use crate::listener::{ListenerRegistry, TransitionEvent, TransitionReason};
use crate::motion::{MotionTarget, MotorMode};
use crate::pid::PidController;
use crate::sync::{MotorExchange, MotorSnapshot, PendingTarget};
use crate::tacho::TachometerReader;
use crate::timebase::TimeBase;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default, Debug)]
pub struct ExecutionStats {
    pub cycles_executed: u64,
    pub cycles_missed: u64,
    pub max_jitter_us: u64,
    pub stalls: u64,
    pub faults: u64,
    pub transitions: u64,
}

#[derive(Debug, Default)]
struct LoopState {
    mode: MotorMode,
    target: Option<MotionTarget>,
    goal: Option<f64>,
    brake_on_completion: bool,
    hold_position: f64,
    position: f64,
    speed: f64,
    commanded_speed: f64,
    move_start_position: f64,
    last_tick: Option<Instant>,
    timestamp_us: u64,
    jitter_us: u32,
    applied_seq: u64,
    target_seq: u64,
    target_reached: bool,
    stall_anchor: f64,
    stall_ticks: u32,
    fault_latched: bool,
    /// `run-forever` has been issued since the last stop.
    drive_engaged: bool,
}

/// The regulation state machine for one motor.
///
/// `apply` and `tick` are plain state transitions driven by the caller's
/// clock, so the whole machine can be stepped deterministically in tests.
/// [`run`](Self::run) is the fixed-cadence loop used by the worker thread.
pub struct MotionRegulator<C: DeviceChannel> {
    channel: C,
    motor: MotorConfig,
    config: RegulatorConfig,
    tacho: TachometerReader,
    move_pid: PidController,
    hold_pid: PidController,
    listeners: Arc<ListenerRegistry>,
    timebase: TimeBase,
    state: LoopState,
    stats: ExecutionStats,
}

struct AliveGuard<'a>(&'a MotorExchange);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_worker_alive(false);
    }
}

impl<C: DeviceChannel> MotionRegulator<C> {
    pub fn new(
        channel: C,
        motor: MotorConfig,
        config: RegulatorConfig,
        listeners: Arc<ListenerRegistry>,
        timebase: TimeBase,
    ) -> Self {
        let tacho = TachometerReader::new(&motor, &config);
        let move_pid =
            PidController::new(motor.move_gains, motor.max_speed).with_min_dt(config.min_pid_dt);
        let hold_pid =
            PidController::new(motor.hold_gains, motor.max_speed).with_min_dt(config.min_pid_dt);
        Self {
            channel,
            motor,
            config,
            tacho,
            move_pid,
            hold_pid,
            listeners,
            timebase,
            state: LoopState::default(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn mode(&self) -> MotorMode {
        self.state.mode
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn snapshot(&self) -> MotorSnapshot {
        MotorSnapshot {
            timestamp_us: self.state.timestamp_us,
            tick_count: self.stats.cycles_executed,
            position: self.state.position,
            speed: self.state.speed,
            commanded_speed: self.state.commanded_speed,
            mode: self.state.mode,
            target: self.state.target,
            move_start_position: self.state.move_start_position,
            applied_seq: self.state.applied_seq,
            target_seq: self.state.target_seq,
            target_reached: self.state.target_reached,
            stall_count: self.stats.stalls,
            fault_count: self.stats.faults,
            cycle_jitter_us: self.state.jitter_us,
        }
    }

    /// Fixed-cadence loop. Returns once shutdown is requested through the exchange.
    pub fn run(&mut self, exchange: &MotorExchange) {
        let _alive = AliveGuard(exchange);
        let start = Instant::now();
        // Polarity is corrected in software; a driver left inverted would flip it twice.
        if let Err(err) = self.channel.write_polarity(Polarity::Normal) {
            self.fault(err, start);
        }

        let mut next_tick = start;
        let mut deferred: Option<PendingTarget> = None;
        loop {
            let pending = exchange.wait_for_commands(next_tick);
            let now = Instant::now();

            if let Some(seq) = pending.reset_tacho {
                self.reset_tacho(seq, now);
            }
            if let Some(incoming) = pending.target {
                if let Some(dropped) = deferred.take() {
                    debug!("target seq={} dropped for seq={}", dropped.seq, incoming.seq);
                }
                if incoming.target.is_stop() {
                    self.apply(incoming.target, incoming.seq, now);
                } else {
                    deferred = Some(incoming);
                }
            }
            if pending.shutdown {
                self.shutdown(now);
                exchange.publish(self.snapshot());
                break;
            }

            if now >= next_tick {
                if now.saturating_duration_since(next_tick) > self.config.tick {
                    self.stats.cycles_missed += 1;
                    next_tick = now;
                }
                self.tick(now, deferred.take());
                next_tick += self.config.tick;
                exchange.publish(self.snapshot());
            } else if !pending.is_empty() {
                exchange.publish(self.snapshot());
            }
        }
    }

    /// One control period: advance the hardware, sample, consume `incoming`
    /// if any, then run the control law of the current mode.
    pub fn tick(&mut self, now: Instant, incoming: Option<PendingTarget>) {
        let dt = self
            .state
            .last_tick
            .map_or(self.config.tick, |last| now.saturating_duration_since(last));
        self.state.last_tick = Some(now);
        let jitter_us = dt.saturating_sub(self.config.tick).as_micros() as u64;
        self.state.jitter_us = jitter_us.min(u64::from(u32::MAX)) as u32;
        self.stats.max_jitter_us = self.stats.max_jitter_us.max(jitter_us);
        self.stats.cycles_executed += 1;
        self.stamp(now);

        self.channel.step(dt);

        match self.tacho.sample(&mut self.channel, now) {
            Ok(sample) => {
                self.state.position = sample.position;
                self.state.speed = sample.speed;
                self.state.fault_latched = false;
            }
            Err(err) => {
                self.sample_failed(err, incoming, now);
                return;
            }
        }

        if let Some(incoming) = incoming {
            self.apply(incoming.target, incoming.seq, now);
        }

        match self.state.mode {
            MotorMode::Moving => self.drive_moving(dt, now),
            MotorMode::Holding => self.drive_holding(dt, now),
            MotorMode::Stopped | MotorMode::Stalled => {}
        }
    }

    /// Consume a command. Stops reach the device immediately; motion
    /// targets arm the state machine and drive the motor from the next tick.
    pub fn apply(&mut self, target: MotionTarget, seq: u64, now: Instant) {
        self.state.applied_seq = self.state.applied_seq.max(seq);
        match target {
            MotionTarget::Stop { brake } => self.apply_stop(brake, seq, now),
            _ => self.begin_motion(target, seq, now),
        }
    }

    /// Make the current position read as zero. Active goals are shifted
    /// with it, so the motion in progress is physically unchanged.
    pub fn reset_tacho(&mut self, seq: u64, now: Instant) {
        self.state.applied_seq = self.state.applied_seq.max(seq);
        let offset = self.state.position;
        self.tacho.rebase(offset);
        self.state.position = 0.0;
        self.state.goal = self.state.goal.map(|goal| goal - offset);
        self.state.hold_position -= offset;
        self.state.move_start_position -= offset;
        self.state.stall_anchor -= offset;
        self.stamp(now);
        info!("tacho count reset (was {:.1} deg)", offset);
    }

    /// Final stop before the worker exits.
    pub fn shutdown(&mut self, now: Instant) {
        if self.state.mode != MotorMode::Stopped {
            match self.halt(StopAction::Brake) {
                Ok(()) => self.transition(MotorMode::Stopped, TransitionReason::Command, now),
                Err(err) => self.fault(err, now),
            }
        }
        info!(
            "regulator shut down after {} ticks ({} missed, {} stalls, {} faults)",
            self.stats.cycles_executed,
            self.stats.cycles_missed,
            self.stats.stalls,
            self.stats.faults
        );
    }

    fn apply_stop(&mut self, brake: bool, seq: u64, now: Instant) {
        // Recorded even when already stopped: a motion target dropped in
        // favour of this stop must resolve as stopped, not superseded.
        self.state.target = Some(MotionTarget::Stop { brake });
        self.state.target_seq = seq;
        self.state.target_reached = false;
        self.state.goal = None;
        if self.state.mode == MotorMode::Stopped {
            debug!("stop seq={} changes nothing, motor already stopped", seq);
            return;
        }
        let action = if brake {
            StopAction::Brake
        } else {
            StopAction::Coast
        };
        match self.halt(action) {
            Ok(()) => self.transition(MotorMode::Stopped, TransitionReason::Command, now),
            Err(err) => self.fault(err, now),
        }
    }

    fn begin_motion(&mut self, target: MotionTarget, seq: u64, now: Instant) {
        let position = self.state.position;
        let (goal, brake_on_completion) = match target {
            MotionTarget::RunForever { .. } => (None, false),
            MotionTarget::RotateBy {
                delta,
                brake_on_completion,
                ..
            } => (Some(position + delta), brake_on_completion),
            MotionTarget::RotateTo {
                position: absolute,
                brake_on_completion,
                ..
            } => (Some(absolute), brake_on_completion),
            MotionTarget::Stop { .. } => return,
        };

        self.move_pid.reset();
        self.hold_pid.reset();
        self.state.target = Some(target);
        self.state.target_seq = seq;
        self.state.target_reached = false;
        self.state.goal = goal;
        self.state.brake_on_completion = brake_on_completion;
        self.state.move_start_position = position;
        self.state.stall_anchor = position;
        self.state.stall_ticks = 0;
        self.state.commanded_speed = 0.0;
        debug!(
            "target seq={} accepted at {:.1} deg: {:?}",
            seq, position, target
        );
        self.transition(MotorMode::Moving, TransitionReason::Command, now);
    }

    fn drive_moving(&mut self, dt: Duration, now: Instant) {
        let Some(target) = self.state.target else {
            return;
        };
        let position = self.state.position;

        if let Some(goal) = self.state.goal {
            if (goal - position).abs() <= self.config.position_tolerance
                && self.state.speed.abs() <= self.config.speed_tolerance
            {
                self.complete(goal, now);
                return;
            }
        }

        if self.stall_detected() {
            self.stall(now);
            return;
        }

        let max_speed = self.motor.max_speed;
        let commanded = match target {
            MotionTarget::RunForever { direction, speed } => direction.sign() * speed.min(max_speed),
            MotionTarget::RotateBy { speed, .. } | MotionTarget::RotateTo { speed, .. } => {
                let limit = speed.min(max_speed);
                let goal = self.state.goal.unwrap_or(position);
                self.move_pid.step(goal, position, dt).clamp(-limit, limit)
            }
            MotionTarget::Stop { .. } => 0.0,
        };
        if let Err(err) = self.drive(commanded) {
            self.fault(err, now);
        }
    }

    fn drive_holding(&mut self, dt: Duration, now: Instant) {
        let max_speed = self.motor.max_speed;
        let correction = self
            .hold_pid
            .step(self.state.hold_position, self.state.position, dt)
            .clamp(-max_speed, max_speed);
        if let Err(err) = self.drive(correction) {
            self.fault(err, now);
        }
    }

    /// No progress of at least `stall_epsilon` for `stall_ticks` consecutive
    /// ticks, while the previous command asked for enough speed to cover
    /// `stall_epsilon` within that window.
    fn stall_detected(&mut self) -> bool {
        let progress = (self.state.position - self.state.stall_anchor).abs();
        if progress >= self.config.stall_epsilon {
            self.state.stall_anchor = self.state.position;
            self.state.stall_ticks = 0;
            return false;
        }
        let window_s = self.config.tick.as_secs_f64() * f64::from(self.config.stall_ticks);
        if self.state.commanded_speed.abs() * window_s >= self.config.stall_epsilon {
            self.state.stall_ticks += 1;
        } else {
            self.state.stall_ticks = 0;
        }
        self.state.stall_ticks >= self.config.stall_ticks.max(1)
    }

    fn complete(&mut self, goal: f64, now: Instant) {
        self.state.target_reached = true;
        if self.state.brake_on_completion {
            self.hold_pid.reset();
            self.state.hold_position = goal;
            self.transition(MotorMode::Holding, TransitionReason::TargetReached, now);
        } else {
            match self.halt(StopAction::Coast) {
                Ok(()) => self.transition(MotorMode::Stopped, TransitionReason::TargetReached, now),
                Err(err) => self.fault(err, now),
            }
        }
    }

    fn stall(&mut self, now: Instant) {
        self.stats.stalls += 1;
        warn!(
            "stall at {:.1} deg: no progress for {} ticks at {:.0} deg/s commanded",
            self.state.position, self.state.stall_ticks, self.state.commanded_speed
        );
        match self.halt(StopAction::Brake) {
            Ok(()) => self.transition(MotorMode::Stalled, TransitionReason::Stalled, now),
            Err(err) => self.fault(err, now),
        }
    }

    fn drive(&mut self, speed: f64) -> Result<(), DeviceIoError> {
        self.channel.write_speed(self.tacho.raw_speed(speed))?;
        self.state.commanded_speed = speed;
        if !self.state.drive_engaged {
            self.channel.write_command(MotorCommand::RunForever)?;
            self.state.drive_engaged = true;
        }
        Ok(())
    }

    fn halt(&mut self, action: StopAction) -> Result<(), DeviceIoError> {
        self.state.commanded_speed = 0.0;
        self.state.drive_engaged = false;
        self.channel.write_speed(0)?;
        self.channel.write_stop_action(action)?;
        self.channel.write_command(MotorCommand::Stop)
    }

    fn sample_failed(&mut self, err: DeviceIoError, incoming: Option<PendingTarget>, now: Instant) {
        if let Some(incoming) = incoming {
            // The command was consumed; record it so its caller sees it stopped.
            self.state.applied_seq = self.state.applied_seq.max(incoming.seq);
            self.state.target = Some(incoming.target);
            self.state.target_seq = incoming.seq;
            self.state.target_reached = false;
        } else if self.state.mode == MotorMode::Stopped {
            if !self.state.fault_latched {
                self.state.fault_latched = true;
                self.stats.faults += 1;
                warn!("tachometer unreadable while stopped: {}", err);
            }
            return;
        }
        self.fault(err, now);
    }

    fn fault(&mut self, err: DeviceIoError, now: Instant) {
        self.stats.faults += 1;
        self.state.fault_latched = true;
        self.state.commanded_speed = 0.0;
        self.state.drive_engaged = false;
        warn!("device fault ({}), stopping motor", err);
        if let Err(stop_err) = self.channel.write_command(MotorCommand::Stop) {
            debug!("stop after fault also failed: {}", stop_err);
        }
        self.transition(MotorMode::Stopped, TransitionReason::Fault(err), now);
    }

    fn transition(&mut self, next: MotorMode, reason: TransitionReason, now: Instant) {
        let previous = self.state.mode;
        self.state.mode = next;
        if previous == next && !matches!(reason, TransitionReason::Fault(_)) {
            return;
        }
        self.stats.transitions += 1;
        let timestamp_us = self.stamp(now);
        info!(
            "motor {} -> {} at {:.1} deg ({:?})",
            previous.as_str(),
            next.as_str(),
            self.state.position,
            reason
        );
        let event = TransitionEvent {
            previous,
            current: next,
            position: self.state.position,
            timestamp_us,
            reason,
        };
        self.listeners.notify(&event);
    }

    fn stamp(&mut self, now: Instant) -> u64 {
        let us = self.timebase.at_us(now).max(self.state.timestamp_us);
        self.state.timestamp_us = us;
        us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_sim::{SimHandle, SimWrite, SimulatedMotor};
    use crate::motion::Direction;
    use parking_lot::Mutex;

    const TICK: Duration = Duration::from_millis(20);

    struct Rig {
        reg: MotionRegulator<SimulatedMotor>,
        sim: SimHandle,
        events: Arc<Mutex<Vec<TransitionEvent>>>,
        now: Instant,
        seq: u64,
    }

    impl Rig {
        fn new(motor: MotorConfig) -> Self {
            let sim_motor = SimulatedMotor::new();
            let sim = sim_motor.handle();
            let listeners = Arc::new(ListenerRegistry::new());
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            listeners.add(Arc::new(move |e: &TransitionEvent| sink.lock().push(e.clone())));
            let now = Instant::now();
            let reg = MotionRegulator::new(
                sim_motor,
                motor,
                RegulatorConfig::default(),
                listeners,
                TimeBase::starting_at(now),
            );
            let mut rig = Self {
                reg,
                sim,
                events,
                now,
                seq: 0,
            };
            rig.tick();
            rig
        }

        fn tick(&mut self) {
            self.now += TICK;
            self.reg.tick(self.now, None);
        }

        fn command(&mut self, target: MotionTarget) -> u64 {
            self.seq += 1;
            self.now += TICK;
            self.reg.tick(
                self.now,
                Some(PendingTarget {
                    seq: self.seq,
                    target,
                }),
            );
            self.seq
        }

        /// Tick until the mode leaves Moving; returns the number of ticks taken.
        fn settle(&mut self, max_ticks: usize) -> Option<usize> {
            (1..=max_ticks).find(|_| {
                self.tick();
                self.reg.mode() != MotorMode::Moving
            })
        }

        fn events(&self) -> Vec<TransitionEvent> {
            self.events.lock().clone()
        }
    }

    fn scenario_config() -> MotorConfig {
        MotorConfig::nxt().with_max_speed(720.0)
    }

    #[test]
    fn rotate_360_settles_within_tolerance() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 360.0,
            speed: 720.0,
            brake_on_completion: true,
        });
        assert_eq!(rig.reg.mode(), MotorMode::Moving);

        let ticks = rig.settle(1500).expect("move never finished");
        let snap = rig.reg.snapshot();
        assert_eq!(snap.mode, MotorMode::Holding, "after {ticks} ticks");
        assert!(snap.target_reached);
        assert!((snap.position - 360.0).abs() <= 1.0, "position {}", snap.position);
        assert_eq!(snap.move_start_position, 0.0);
    }

    #[test]
    fn commanded_speed_never_exceeds_limit() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 2000.0,
            speed: 400.0,
            brake_on_completion: false,
        });
        for _ in 0..100 {
            rig.tick();
            assert!(rig.reg.snapshot().commanded_speed.abs() <= 400.0);
        }
        let max_written = rig
            .sim
            .writes()
            .iter()
            .filter_map(|w| match w {
                SimWrite::Speed(sp) => Some(sp.abs()),
                _ => None,
            })
            .max()
            .unwrap();
        assert_eq!(max_written, 400);
    }

    #[test]
    fn run_forever_is_clamped_to_max_speed() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RunForever {
            direction: Direction::Backward,
            speed: 5000.0,
        });
        assert_eq!(rig.sim.speed_sp(), -720);
        assert_eq!(rig.sim.last_command(), MotorCommand::RunForever);
        for _ in 0..20 {
            rig.tick();
        }
        assert!(rig.reg.snapshot().position < -100.0);
    }

    #[test]
    fn completion_without_brake_coasts_to_stop() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateTo {
            position: 90.0,
            speed: 360.0,
            brake_on_completion: false,
        });
        rig.settle(1500).expect("move never finished");
        let snap = rig.reg.snapshot();
        assert_eq!(snap.mode, MotorMode::Stopped);
        assert!(snap.target_reached);
        assert!((snap.position - 90.0).abs() <= 1.0);
        let tail: Vec<_> = rig.sim.writes().into_iter().rev().take(3).collect();
        assert_eq!(
            tail,
            vec![
                SimWrite::Command(MotorCommand::Stop),
                SimWrite::StopAction(StopAction::Coast),
                SimWrite::Speed(0),
            ]
        );
        let last = rig.events().pop().unwrap();
        assert_eq!(last.reason, TransitionReason::TargetReached);
    }

    #[test]
    fn stall_detected_within_window_and_brakes() {
        let mut rig = Rig::new(scenario_config());
        rig.sim.set_jammed(true);
        rig.command(MotionTarget::RotateBy {
            delta: 360.0,
            speed: 500.0,
            brake_on_completion: true,
        });
        let window = RegulatorConfig::default().stall_ticks as usize;
        let ticks = rig.settle(window + 1).expect("stall not detected");
        assert!(ticks <= window, "took {ticks} ticks");
        assert_eq!(rig.reg.mode(), MotorMode::Stalled);

        let writes = rig.sim.writes();
        let tail = &writes[writes.len() - 3..];
        assert_eq!(
            tail,
            &[
                SimWrite::Speed(0),
                SimWrite::StopAction(StopAction::Brake),
                SimWrite::Command(MotorCommand::Stop),
            ]
        );

        // Stalled: no further corrections.
        let count = rig.sim.write_count();
        for _ in 0..10 {
            rig.tick();
        }
        assert_eq!(rig.sim.write_count(), count);
        assert_eq!(rig.reg.snapshot().stall_count, 1);
        assert_eq!(rig.events().last().unwrap().reason, TransitionReason::Stalled);

        // A new command clears the stall.
        rig.sim.set_jammed(false);
        rig.command(MotionTarget::RotateBy {
            delta: 45.0,
            speed: 500.0,
            brake_on_completion: true,
        });
        assert_eq!(rig.reg.mode(), MotorMode::Moving);
        rig.settle(1500).expect("move never finished");
        assert_eq!(rig.reg.mode(), MotorMode::Holding);
    }

    #[test]
    fn slow_final_approach_is_not_a_stall() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 30.0,
            speed: 720.0,
            brake_on_completion: true,
        });
        rig.settle(1500).expect("move never finished");
        assert_eq!(rig.reg.mode(), MotorMode::Holding);
        assert_eq!(rig.reg.snapshot().stall_count, 0);
    }

    #[test]
    fn read_fault_while_moving_stops_and_reports_once() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RunForever {
            direction: Direction::Forward,
            speed: 300.0,
        });
        for _ in 0..5 {
            rig.tick();
        }
        let events_before = rig.events().len();
        rig.sim.clear_writes();
        rig.sim.fail_reads_after(0);

        for _ in 0..10 {
            rig.tick();
        }
        assert_eq!(rig.reg.mode(), MotorMode::Stopped);

        let faults: Vec<_> = rig.events()[events_before..].to_vec();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].previous, MotorMode::Moving);
        assert!(matches!(faults[0].reason, TransitionReason::Fault(ref e) if e.attribute() == "position"));

        // Only the fail-safe stop reached the device.
        assert_eq!(rig.sim.writes(), vec![SimWrite::Command(MotorCommand::Stop)]);
        assert_eq!(rig.reg.snapshot().fault_count, 1);
    }

    fn fault_events(rig: &Rig, since: usize) -> Vec<TransitionEvent> {
        rig.events()[since..]
            .iter()
            .filter(|e| matches!(e.reason, TransitionReason::Fault(_)))
            .cloned()
            .collect()
    }

    #[test]
    fn write_fault_while_moving_stops_and_reports_once() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RunForever {
            direction: Direction::Forward,
            speed: 300.0,
        });
        rig.tick();
        let events_before = rig.events().len();
        rig.sim.clear_writes();
        rig.sim.fail_writes_after(0);

        for _ in 0..10 {
            rig.tick();
        }
        assert_eq!(rig.reg.mode(), MotorMode::Stopped);
        assert_eq!(rig.events().len(), events_before + 1);
        let faults = fault_events(&rig, events_before);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].previous, MotorMode::Moving);
        assert!(matches!(faults[0].reason, TransitionReason::Fault(ref e) if e.attribute() == "speed_sp"));
        assert!(rig.sim.writes().is_empty());
        assert_eq!(rig.reg.snapshot().commanded_speed, 0.0);
        assert_eq!(rig.reg.snapshot().fault_count, 1);
    }

    #[test]
    fn write_fault_while_holding_stops_and_reports_once() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 90.0,
            speed: 360.0,
            brake_on_completion: true,
        });
        rig.settle(1500).expect("move never finished");
        assert_eq!(rig.reg.mode(), MotorMode::Holding);
        let events_before = rig.events().len();
        rig.sim.fail_writes_after(0);

        for _ in 0..10 {
            rig.tick();
        }
        assert_eq!(rig.reg.mode(), MotorMode::Stopped);
        let faults = fault_events(&rig, events_before);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].previous, MotorMode::Holding);
        assert_eq!(faults[0].current, MotorMode::Stopped);
        assert_eq!(rig.reg.snapshot().fault_count, 1);

        // Writes work again: the next command drives normally.
        rig.sim.restore();
        rig.command(MotionTarget::RotateBy {
            delta: -90.0,
            speed: 360.0,
            brake_on_completion: true,
        });
        assert_eq!(rig.reg.mode(), MotorMode::Moving);
        rig.settle(1500).expect("move never finished");
        assert_eq!(rig.reg.mode(), MotorMode::Holding);
    }

    #[test]
    fn failed_stop_is_reported_as_fault() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RunForever {
            direction: Direction::Backward,
            speed: 300.0,
        });
        rig.tick();
        let events_before = rig.events().len();
        rig.sim.fail_writes_after(0);

        rig.now += TICK;
        rig.reg.apply(MotionTarget::Stop { brake: false }, 50, rig.now);
        assert_eq!(rig.reg.mode(), MotorMode::Stopped);
        assert_eq!(rig.reg.snapshot().applied_seq, 50);
        let faults = fault_events(&rig, events_before);
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0].reason, TransitionReason::Fault(ref e) if e.attribute() == "speed_sp"));

        rig.tick();
        assert_eq!(rig.events().len(), events_before + 1);
    }

    #[test]
    fn write_fault_on_stall_brake_still_stops() {
        let mut rig = Rig::new(scenario_config());
        rig.sim.set_jammed(true);
        rig.command(MotionTarget::RotateBy {
            delta: 360.0,
            speed: 500.0,
            brake_on_completion: true,
        });
        // Drive writes keep succeeding; only the stall brake hits the failure.
        let window = RegulatorConfig::default().stall_ticks;
        for _ in 1..window {
            rig.tick();
            assert_eq!(rig.reg.mode(), MotorMode::Moving);
        }
        let events_before = rig.events().len();
        rig.sim.fail_writes_after(0);
        rig.settle(2).expect("stall not detected");

        assert_eq!(rig.reg.mode(), MotorMode::Stopped);
        assert_eq!(rig.reg.snapshot().stall_count, 1);
        let faults = fault_events(&rig, events_before);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].previous, MotorMode::Moving);
    }

    #[test]
    fn stop_when_stopped_is_a_no_op() {
        let mut rig = Rig::new(scenario_config());
        let before = rig.reg.snapshot();
        let writes = rig.sim.write_count();
        let events = rig.events().len();

        rig.now += TICK;
        rig.reg.apply(MotionTarget::Stop { brake: true }, 1, rig.now);

        let after = rig.reg.snapshot();
        assert_eq!(after.mode, before.mode);
        assert_eq!(after.target, Some(MotionTarget::Stop { brake: true }));
        assert_eq!(after.target_seq, 1);
        assert_eq!(after.position, before.position);
        assert_eq!(after.commanded_speed, before.commanded_speed);
        assert_eq!(rig.sim.write_count(), writes);
        assert_eq!(rig.events().len(), events);
    }

    #[test]
    fn stop_acts_without_waiting_for_a_tick() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RunForever {
            direction: Direction::Forward,
            speed: 300.0,
        });
        rig.tick();
        rig.reg.apply(MotionTarget::Stop { brake: true }, 99, rig.now);
        assert_eq!(rig.reg.mode(), MotorMode::Stopped);
        assert_eq!(rig.reg.snapshot().applied_seq, 99);
        assert_eq!(rig.sim.last_command(), MotorCommand::Stop);
        let writes = rig.sim.writes();
        assert_eq!(
            writes[writes.len() - 2],
            SimWrite::StopAction(StopAction::Brake)
        );
    }

    #[test]
    fn hold_resists_disturbance() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateTo {
            position: 90.0,
            speed: 720.0,
            brake_on_completion: true,
        });
        rig.settle(1500).expect("move never finished");
        assert_eq!(rig.reg.mode(), MotorMode::Holding);

        rig.sim.set_position(105.0);
        for _ in 0..300 {
            rig.tick();
        }
        assert_eq!(rig.reg.mode(), MotorMode::Holding);
        let position = rig.reg.snapshot().position;
        assert!((position - 90.0).abs() <= 2.0, "position {position}");
    }

    #[test]
    fn new_target_resets_and_records_start() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 100.0,
            speed: 720.0,
            brake_on_completion: true,
        });
        for _ in 0..10 {
            rig.tick();
        }
        let midway = rig.reg.snapshot().position;
        let seq = rig.command(MotionTarget::RotateBy {
            delta: -50.0,
            speed: 720.0,
            brake_on_completion: true,
        });
        let snap = rig.reg.snapshot();
        assert_eq!(snap.target_seq, seq);
        assert!((snap.move_start_position - midway).abs() < 60.0);
        rig.settle(1500).expect("move never finished");
        let end = rig.reg.snapshot().position;
        assert!((end - (snap.move_start_position - 50.0)).abs() <= 1.0);
    }

    #[test]
    fn reset_tacho_rebases_position() {
        let mut rig = Rig::new(scenario_config());
        rig.sim.set_position(123.0);
        rig.tick();
        assert_eq!(rig.reg.snapshot().tacho_count(), 123);
        rig.reg.reset_tacho(7, rig.now);
        assert_eq!(rig.reg.snapshot().tacho_count(), 0);
        rig.tick();
        assert_eq!(rig.reg.snapshot().tacho_count(), 0);
        assert_eq!(rig.reg.snapshot().applied_seq, 7);
    }

    #[test]
    fn inversed_polarity_flips_commands_and_readings() {
        let mut rig = Rig::new(scenario_config().with_polarity(Polarity::Inversed));
        rig.command(MotionTarget::RotateTo {
            position: 90.0,
            speed: 360.0,
            brake_on_completion: true,
        });
        assert!(rig.sim.speed_sp() < 0);
        rig.settle(1500).expect("move never finished");
        assert!((rig.reg.snapshot().position - 90.0).abs() <= 1.0);
        assert!((rig.sim.position() + 90.0).abs() <= 1.5);
    }

    #[test]
    fn event_timestamps_are_monotonic() {
        let mut rig = Rig::new(scenario_config());
        rig.command(MotionTarget::RotateBy {
            delta: 20.0,
            speed: 720.0,
            brake_on_completion: false,
        });
        rig.settle(1500).expect("move never finished");
        rig.command(MotionTarget::RunForever {
            direction: Direction::Forward,
            speed: 100.0,
        });
        rig.reg.apply(MotionTarget::Stop { brake: false }, 50, rig.now);
        let events = rig.events();
        assert!(events.len() >= 4);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].timestamp_us <= pair[1].timestamp_us));
    }
}
