use crate::config::{MotorConfig, RegulatorConfig};
use crate::error::MotorError;
use crate::hal::DeviceChannel;
use crate::listener::{ListenerRegistry, MoveListener};
use crate::motion::{Direction, MotionTarget, MotorMode, MoveOutcome};
use crate::regulator::{ExecutionStats, MotionRegulator};
use crate::sync::{MotorExchange, MotorSnapshot, WaitResult};
use crate::timebase::TimeBase;
use log::{error, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SPEED: f64 = 360.0;

#[derive(Debug, Clone, Copy)]
struct MotionSettings {
    speed: f64,
    brake_on_completion: bool,
}

/// A motor under closed-loop position and speed control.
///
/// Owns a background worker that runs the regulation loop and is the only
/// thread touching the device. Every method here runs on the caller's
/// thread and talks to the worker through a [`MotorExchange`]: commands go
/// into a last-writer-wins slot, state comes back as copied snapshots.
///
/// ```no_run
/// use motor_core::{MotorConfig, RegulatedMotor, RegulatorConfig, SimulatedMotor};
///
/// let motor = RegulatedMotor::new(
///     SimulatedMotor::new(),
///     MotorConfig::ev3_large(),
///     RegulatorConfig::default(),
/// )?;
/// motor.set_speed(540.0)?;
/// let outcome = motor.rotate(90.0, true)?;
/// println!("{outcome:?} at {} deg", motor.tacho_count());
/// # Ok::<(), motor_core::MotorError>(())
/// ```
pub struct RegulatedMotor {
    exchange: Arc<MotorExchange>,
    listeners: Arc<ListenerRegistry>,
    motor: MotorConfig,
    config: RegulatorConfig,
    settings: Mutex<MotionSettings>,
    worker: Option<JoinHandle<ExecutionStats>>,
}

impl RegulatedMotor {
    pub fn new<C>(channel: C, motor: MotorConfig, config: RegulatorConfig) -> Result<Self, MotorError>
    where
        C: DeviceChannel + 'static,
    {
        motor.validate()?;
        config.validate()?;

        let exchange = Arc::new(MotorExchange::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let mut regulator = MotionRegulator::new(
            channel,
            motor,
            config.clone(),
            Arc::clone(&listeners),
            TimeBase::new(),
        );

        exchange.set_worker_alive(true);
        let worker_exchange = Arc::clone(&exchange);
        let spawned = thread::Builder::new()
            .name("motor-regulator".to_string())
            .spawn(move || {
                regulator.run(&worker_exchange);
                regulator.stats().clone()
            });
        let worker = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                exchange.set_worker_alive(false);
                return Err(MotorError::Spawn(err.to_string()));
            }
        };

        let first_tick =
            exchange.wait_until(Instant::now() + STARTUP_TIMEOUT, |s| s.tick_count > 0);
        if !matches!(first_tick, WaitResult::Satisfied(_)) {
            warn!("regulation worker has not completed a tick after {:?}", STARTUP_TIMEOUT);
        }

        Ok(Self {
            exchange,
            listeners,
            motor,
            config,
            settings: Mutex::new(MotionSettings {
                speed: DEFAULT_SPEED.min(motor.max_speed),
                brake_on_completion: true,
            }),
            worker: Some(worker),
        })
    }

    pub fn forward(&self) -> Result<(), MotorError> {
        self.run_forever(Direction::Forward)
    }

    pub fn backward(&self) -> Result<(), MotorError> {
        self.run_forever(Direction::Backward)
    }

    /// Stop now. Returns once the worker has applied the stop.
    pub fn stop(&self, immediate_brake: bool) -> Result<MotorSnapshot, MotorError> {
        let seq = self.submit(MotionTarget::Stop {
            brake: immediate_brake,
        })?;
        self.await_applied(seq)
    }

    pub fn set_speed(&self, degrees_per_sec: f64) -> Result<(), MotorError> {
        let limit = self.motor.max_speed;
        if !degrees_per_sec.is_finite() || !(0.0..=limit).contains(&degrees_per_sec) {
            return Err(MotorError::SpeedOutOfRange {
                requested: degrees_per_sec,
                limit,
            });
        }
        self.settings.lock().speed = degrees_per_sec;

        let snapshot = self.exchange.snapshot();
        if let (MotorMode::Moving, Some(MotionTarget::RunForever { direction, .. })) =
            (snapshot.mode, snapshot.target)
        {
            self.submit(MotionTarget::RunForever {
                direction,
                speed: degrees_per_sec,
            })?;
        }
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.settings.lock().speed
    }

    pub fn max_speed(&self) -> f64 {
        self.motor.max_speed
    }

    /// Whether later rotate commands hold their end position.
    pub fn set_brake_on_completion(&self, brake: bool) {
        self.settings.lock().brake_on_completion = brake;
    }

    pub fn rotate(&self, delta_degrees: f64, block: bool) -> Result<MoveOutcome, MotorError> {
        self.rotate_timeout(delta_degrees, block, self.config.wait_timeout)
    }

    pub fn rotate_timeout(
        &self,
        delta_degrees: f64,
        block: bool,
        timeout: Duration,
    ) -> Result<MoveOutcome, MotorError> {
        if !delta_degrees.is_finite() {
            return Err(MotorError::InvalidTarget(format!(
                "rotation of {delta_degrees} degrees"
            )));
        }
        let (speed, brake_on_completion) = self.move_settings()?;
        let target = MotionTarget::RotateBy {
            delta: delta_degrees,
            speed,
            brake_on_completion,
        };
        self.dispatch(target, block, timeout)
    }

    pub fn rotate_to(&self, absolute_degrees: f64, block: bool) -> Result<MoveOutcome, MotorError> {
        self.rotate_to_timeout(absolute_degrees, block, self.config.wait_timeout)
    }

    pub fn rotate_to_timeout(
        &self,
        absolute_degrees: f64,
        block: bool,
        timeout: Duration,
    ) -> Result<MoveOutcome, MotorError> {
        if !absolute_degrees.is_finite() {
            return Err(MotorError::InvalidTarget(format!(
                "absolute position {absolute_degrees}"
            )));
        }
        let (speed, brake_on_completion) = self.move_settings()?;
        let target = MotionTarget::RotateTo {
            position: absolute_degrees,
            speed,
            brake_on_completion,
        };
        self.dispatch(target, block, timeout)
    }

    /// Block until the most recent command has left `Moving`.
    pub fn wait_complete(&self, timeout: Duration) -> MoveOutcome {
        let seq = self.exchange.last_target_seq();
        if seq == 0 {
            let snapshot = self.exchange.snapshot();
            return MoveOutcome::Stopped {
                position: snapshot.position,
            };
        }
        self.await_move(seq, timeout)
    }

    pub fn is_moving(&self) -> bool {
        self.exchange.snapshot().is_moving()
    }

    pub fn is_stalled(&self) -> bool {
        self.exchange.snapshot().mode == MotorMode::Stalled
    }

    pub fn mode(&self) -> MotorMode {
        self.exchange.snapshot().mode
    }

    pub fn tacho_count(&self) -> i32 {
        self.exchange.snapshot().tacho_count()
    }

    pub fn position(&self) -> f64 {
        self.exchange.snapshot().position
    }

    pub fn snapshot(&self) -> MotorSnapshot {
        self.exchange.snapshot()
    }

    /// Make the current position read as zero. Waits for the worker to apply it.
    pub fn reset_tacho_count(&self) -> Result<(), MotorError> {
        self.ensure_worker()?;
        let seq = self.exchange.request_tacho_reset();
        self.await_applied(seq).map(|_| ())
    }

    pub fn add_move_listener<L>(&self, listener: L)
    where
        L: MoveListener + 'static,
    {
        self.listeners.add(Arc::new(listener));
    }

    pub fn motor_config(&self) -> &MotorConfig {
        &self.motor
    }

    pub fn regulator_config(&self) -> &RegulatorConfig {
        &self.config
    }

    /// Stop the motor, join the worker and release the device.
    pub fn shutdown(mut self) -> ExecutionStats {
        self.join_worker().unwrap_or_default()
    }

    fn run_forever(&self, direction: Direction) -> Result<(), MotorError> {
        let speed = self.settings.lock().speed;
        self.submit(MotionTarget::RunForever { direction, speed })
            .map(|_| ())
    }

    fn move_settings(&self) -> Result<(f64, bool), MotorError> {
        let settings = *self.settings.lock();
        if settings.speed <= 0.0 {
            return Err(MotorError::InvalidTarget(
                "rotation requested at zero speed".to_string(),
            ));
        }
        Ok((settings.speed, settings.brake_on_completion))
    }

    fn dispatch(
        &self,
        target: MotionTarget,
        block: bool,
        timeout: Duration,
    ) -> Result<MoveOutcome, MotorError> {
        let seq = self.submit(target)?;
        if !block {
            return Ok(MoveOutcome::InProgress);
        }
        Ok(self.await_move(seq, timeout))
    }

    fn submit(&self, target: MotionTarget) -> Result<u64, MotorError> {
        self.ensure_worker()?;
        Ok(self.exchange.submit_target(target))
    }

    fn ensure_worker(&self) -> Result<(), MotorError> {
        if self.exchange.worker_alive() {
            Ok(())
        } else {
            Err(MotorError::WorkerUnavailable)
        }
    }

    fn await_applied(&self, seq: u64) -> Result<MotorSnapshot, MotorError> {
        let deadline = deadline_after(self.config.wait_timeout);
        match self.exchange.wait_until(deadline, |s| s.applied_seq >= seq) {
            WaitResult::Satisfied(snapshot) => Ok(snapshot),
            WaitResult::TimedOut(_) | WaitResult::WorkerGone(_) => {
                Err(MotorError::WorkerUnavailable)
            }
        }
    }

    fn await_move(&self, seq: u64, timeout: Duration) -> MoveOutcome {
        let result = self.exchange.wait_until(deadline_after(timeout), |s| {
            s.applied_seq >= seq && (s.target_seq != seq || !s.is_moving())
        });
        match result {
            WaitResult::Satisfied(snapshot) | WaitResult::WorkerGone(snapshot) => {
                outcome_of(&snapshot, seq)
            }
            WaitResult::TimedOut(_) => MoveOutcome::TimedOut,
        }
    }

    fn join_worker(&mut self) -> Option<ExecutionStats> {
        let worker = self.worker.take()?;
        self.exchange.request_shutdown();
        match worker.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                error!("regulation worker panicked");
                None
            }
        }
    }
}

impl Drop for RegulatedMotor {
    fn drop(&mut self) {
        self.join_worker();
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

fn outcome_of(snapshot: &MotorSnapshot, seq: u64) -> MoveOutcome {
    let position = snapshot.position;
    if snapshot.applied_seq < seq {
        return MoveOutcome::Stopped { position };
    }
    if snapshot.target_seq != seq {
        return match snapshot.target {
            Some(target) if target.is_stop() => MoveOutcome::Stopped { position },
            _ => MoveOutcome::Superseded,
        };
    }
    match snapshot.mode {
        MotorMode::Holding => MoveOutcome::Completed { position },
        MotorMode::Stalled => MoveOutcome::Stalled { position },
        MotorMode::Stopped if snapshot.target_reached => MoveOutcome::Completed { position },
        MotorMode::Stopped | MotorMode::Moving => MoveOutcome::Stopped { position },
    }
}
