use crate::infra::audit::{AuditEventType, AuditSink, AuditTrail};
use crate::runtime::config::{Cli, ConfigError, DeviceSource, RuntimeConfig, Step};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use clap::Parser;
use motor_core::{
    DeviceChannel, DeviceIoError, ExecutionStats, MotorCommand, MotorError, MoveOutcome, Polarity,
    RegulatedMotor, SimulatedMotor, StateFlags, StopAction, TimeBase, TransitionEvent,
};
use motor_io::SysfsMotor;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Motor(#[from] MotorError),
    #[error("failed to open motor: {0}")]
    Device(#[from] DeviceIoError),
    #[error("failed to open {what} {path}: {source}")]
    Io {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("command `{step}` ended {outcome:?}")]
    StepFailed { step: Step, outcome: MoveOutcome },
}

/// The motor actually driven: simulated or sysfs.
enum ControllerMotor {
    Simulated(SimulatedMotor),
    Sysfs(SysfsMotor),
}

impl DeviceChannel for ControllerMotor {
    fn write_command(&mut self, command: MotorCommand) -> Result<(), DeviceIoError> {
        match self {
            Self::Simulated(m) => m.write_command(command),
            Self::Sysfs(m) => m.write_command(command),
        }
    }

    fn write_speed(&mut self, speed_sp: i32) -> Result<(), DeviceIoError> {
        match self {
            Self::Simulated(m) => m.write_speed(speed_sp),
            Self::Sysfs(m) => m.write_speed(speed_sp),
        }
    }

    fn write_position_sp(&mut self, position_sp: i32) -> Result<(), DeviceIoError> {
        match self {
            Self::Simulated(m) => m.write_position_sp(position_sp),
            Self::Sysfs(m) => m.write_position_sp(position_sp),
        }
    }

    fn write_stop_action(&mut self, action: StopAction) -> Result<(), DeviceIoError> {
        match self {
            Self::Simulated(m) => m.write_stop_action(action),
            Self::Sysfs(m) => m.write_stop_action(action),
        }
    }

    fn write_polarity(&mut self, polarity: Polarity) -> Result<(), DeviceIoError> {
        match self {
            Self::Simulated(m) => m.write_polarity(polarity),
            Self::Sysfs(m) => m.write_polarity(polarity),
        }
    }

    fn read_position(&mut self) -> Result<i32, DeviceIoError> {
        match self {
            Self::Simulated(m) => m.read_position(),
            Self::Sysfs(m) => m.read_position(),
        }
    }

    fn read_speed(&mut self) -> Result<i32, DeviceIoError> {
        match self {
            Self::Simulated(m) => m.read_speed(),
            Self::Sysfs(m) => m.read_speed(),
        }
    }

    fn read_state(&mut self) -> Result<StateFlags, DeviceIoError> {
        match self {
            Self::Simulated(m) => m.read_state(),
            Self::Sysfs(m) => m.read_state(),
        }
    }

    fn has_native_speed(&self) -> bool {
        match self {
            Self::Simulated(m) => m.has_native_speed(),
            Self::Sysfs(m) => m.has_native_speed(),
        }
    }

    fn step(&mut self, dt: Duration) {
        match self {
            Self::Simulated(m) => m.step(dt),
            Self::Sysfs(m) => m.step(dt),
        }
    }
}

pub fn run_from_args() -> Result<(), AppError> {
    let config = RuntimeConfig::from_cli(Cli::parse())?;
    run(config).map(|_| ())
}

pub fn run(mut config: RuntimeConfig) -> Result<ExecutionStats, AppError> {
    let _log_guard =
        init_tracing(config.json_logs, config.log_file.as_deref()).map_err(|source| AppError::Io {
            what: "log file",
            path: config.log_file.clone().unwrap_or_default(),
            source,
        })?;

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let audit = match &config.audit_path {
        Some(path) => {
            let trail = AuditTrail::start(path, timebase).map_err(|source| AppError::Io {
                what: "audit log",
                path: path.clone(),
                source,
            })?;
            info!(path = %path.display(), "Audit logging enabled");
            Some(trail)
        }
        None => None,
    };
    let audit_sink = audit.as_ref().map(AuditTrail::sink);

    let channel = open_motor(&mut config)?;
    if let Some(sink) = &audit_sink {
        sink.record_now(
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "model": config.model,
                "device": format!("{:?}", config.device),
                "max_speed": config.motor.max_speed,
                "tick_ms": config.regulator.tick.as_secs_f64() * 1000.0,
            }),
        );
    }

    info!(
        model = %config.model,
        max_speed = config.motor.max_speed,
        tick_ms = config.regulator.tick.as_millis() as u64,
        "Starting regulated motor"
    );
    let motor = Arc::new(RegulatedMotor::new(
        channel,
        config.motor,
        config.regulator.clone(),
    )?);
    motor.add_move_listener(log_transition);
    motor.add_move_listener(telemetry::count_transition);
    if let Some(sink) = &audit_sink {
        motor.add_move_listener(sink.listener());
    }
    if let Some(speed) = config.speed {
        motor.set_speed(speed)?;
    }
    motor.set_brake_on_completion(config.brake_on_completion);

    let stop = Arc::new(AtomicBool::new(false));
    let updater = {
        let motor = Arc::clone(&motor);
        telemetry::start_metrics_updater(move || motor.snapshot(), Arc::clone(&stop))
    };

    let script = run_script(&motor, &config.steps, audit_sink.as_ref());

    if script.is_ok() {
        if let Some(seconds) = config.run_seconds {
            info!(seconds, "Running for limited duration");
            thread::sleep(Duration::from_secs(seconds));
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = updater.join();

    let final_snapshot = motor.snapshot();
    let stats = match Arc::try_unwrap(motor) {
        Ok(motor) => motor.shutdown(),
        Err(_) => {
            warn!("Motor still shared at shutdown; dropping last handle elsewhere");
            ExecutionStats::default()
        }
    };

    info!(
        cycles_executed = stats.cycles_executed,
        cycles_missed = stats.cycles_missed,
        max_jitter_us = stats.max_jitter_us,
        stalls = stats.stalls,
        faults = stats.faults,
        position = final_snapshot.position,
        "Run complete"
    );

    if let Some(sink) = audit_sink {
        sink.record_now(
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "cycles_executed": stats.cycles_executed,
                "cycles_missed": stats.cycles_missed,
                "stalls": stats.stalls,
                "faults": stats.faults,
                "position": final_snapshot.position,
            }),
        );
    }
    if let Some(trail) = audit {
        let written = trail.finish();
        debug!(entries = written, "Audit log closed");
    }

    script.map(|_| stats)
}

fn open_motor(config: &mut RuntimeConfig) -> Result<ControllerMotor, AppError> {
    match &config.device {
        DeviceSource::Simulated => {
            info!("Simulation mode enabled");
            // Nothing inspects the write journal outside tests.
            Ok(ControllerMotor::Simulated(
                SimulatedMotor::with_max_speed(config.motor.max_speed).with_journal_capacity(0),
            ))
        }
        DeviceSource::Sysfs { class_root, port } => {
            let mut motor = SysfsMotor::find(class_root, port)?;
            info!(
                port = %port,
                path = %motor.path().display(),
                driver = motor.driver_name().as_deref().unwrap_or("unknown"),
                "Motor found"
            );
            if let Some(counts) = motor.counts_per_rot() {
                config.motor.counts_per_rot = counts;
            }
            if config.reset_device {
                motor.reset()?;
            }
            Ok(ControllerMotor::Sysfs(motor))
        }
    }
}

fn run_script(
    motor: &RegulatedMotor,
    steps: &[Step],
    audit: Option<&AuditSink>,
) -> Result<(), AppError> {
    for step in steps {
        info!(command = %step, "Executing");
        if let Some(sink) = audit {
            sink.record_now(
                AuditEventType::CommandIssued,
                serde_json::json!({ "command": step.to_string() }),
            );
        }
        let outcome = execute(motor, *step)?;
        if let Some(outcome) = outcome {
            info!(command = %step, ?outcome, tacho = motor.tacho_count(), "Finished");
            if let Some(sink) = audit {
                sink.record_now(
                    AuditEventType::CommandFinished,
                    serde_json::json!({ "command": step.to_string(), "outcome": outcome }),
                );
            }
            if matches!(outcome, MoveOutcome::Stalled { .. } | MoveOutcome::Stopped { .. }) {
                return Err(AppError::StepFailed {
                    step: *step,
                    outcome,
                });
            }
        }
    }
    Ok(())
}

fn execute(motor: &RegulatedMotor, step: Step) -> Result<Option<MoveOutcome>, MotorError> {
    match step {
        Step::Forward => motor.forward()?,
        Step::Backward => motor.backward()?,
        Step::Stop { brake } => {
            motor.stop(brake)?;
        }
        Step::Speed(dps) => motor.set_speed(dps)?,
        Step::Rotate { delta, block } => return motor.rotate(delta, block).map(Some),
        Step::RotateTo { position, block } => return motor.rotate_to(position, block).map(Some),
        Step::Wait(duration) => thread::sleep(duration),
        Step::ResetTacho => motor.reset_tacho_count()?,
        Step::Hold(on) => motor.set_brake_on_completion(on),
    }
    Ok(None)
}

fn log_transition(event: &TransitionEvent) {
    info!(
        from = event.previous.as_str(),
        to = event.current.as_str(),
        position = event.position,
        reason = ?event.reason,
        "Motor transition"
    );
}
