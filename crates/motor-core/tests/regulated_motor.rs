use motor_core::{
    MotorCommand, MotorConfig, MotorError, MotorMode, MoveOutcome, RegulatedMotor,
    RegulatorConfig, SimHandle, SimWrite, SimulatedMotor, TransitionEvent, TransitionReason,
};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn start(motor: MotorConfig) -> (RegulatedMotor, SimHandle) {
    let sim = SimulatedMotor::new();
    let handle = sim.handle();
    let config = RegulatorConfig::default().with_rate_hz(100);
    let motor = RegulatedMotor::new(sim, motor, config).expect("motor starts");
    (motor, handle)
}

fn record_events(motor: &RegulatedMotor) -> Arc<Mutex<Vec<TransitionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    motor.add_move_listener(move |event: &TransitionEvent| sink.lock().push(event.clone()));
    events
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn blocking_rotate_to_reaches_target() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    motor.set_speed(540.0).unwrap();

    let outcome = motor.rotate_to(90.0, true).unwrap();
    assert!(matches!(outcome, MoveOutcome::Completed { .. }), "{outcome:?}");
    assert!((motor.tacho_count() - 90).abs() <= 2, "at {}", motor.tacho_count());
    assert!(!motor.is_moving());
    assert_eq!(motor.mode(), MotorMode::Holding);

    let outcome = motor.rotate_to(0.0, true).unwrap();
    assert!(matches!(outcome, MoveOutcome::Completed { .. }), "{outcome:?}");
    assert!(motor.tacho_count().abs() <= 2);
}

#[test]
fn full_turn_at_scenario_gains() {
    let (motor, _sim) = start(MotorConfig::nxt().with_max_speed(720.0));
    motor.set_speed(720.0).unwrap();
    let events = record_events(&motor);

    let outcome = motor.rotate(360.0, true).unwrap();
    match outcome {
        MoveOutcome::Completed { position } => assert!((position - 360.0).abs() <= 1.0),
        other => panic!("unexpected outcome {other:?}"),
    }
    let modes: Vec<_> = events.lock().iter().map(|e| e.current).collect();
    assert_eq!(modes, vec![MotorMode::Moving, MotorMode::Holding]);
}

#[test]
fn non_blocking_rotate_returns_immediately() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    let outcome = motor.rotate(720.0, false).unwrap();
    assert_eq!(outcome, MoveOutcome::InProgress);
    assert!(wait_for(Duration::from_secs(1), || motor.is_moving()));
    motor.stop(true).unwrap();
    assert!(!motor.is_moving());
}

#[test]
fn concurrent_rotations_resolve_to_one_winner() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    let motor = Arc::new(motor);
    let barrier = Arc::new(Barrier::new(2));

    let callers: Vec<_> = [100.0, -50.0]
        .into_iter()
        .map(|delta| {
            let motor = Arc::clone(&motor);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (delta, motor.rotate(delta, true).unwrap())
            })
        })
        .collect();
    let outcomes: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, MoveOutcome::Completed { .. }))
        .collect();
    let losers = outcomes
        .iter()
        .filter(|(_, o)| *o == MoveOutcome::Superseded)
        .count();
    assert_eq!(winners.len(), 1, "{outcomes:?}");
    assert_eq!(losers, 1, "{outcomes:?}");

    let snapshot = motor.snapshot();
    let expected = snapshot.move_start_position + winners[0].0;
    assert!((snapshot.position - expected).abs() <= 2.0, "{snapshot:?}");
}

#[test]
fn device_fault_stops_motor_and_reports_once() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    let events = record_events(&motor);
    motor.forward().unwrap();
    assert!(wait_for(Duration::from_secs(1), || motor.is_moving()));

    sim.fail_reads_after(0);
    assert!(wait_for(Duration::from_secs(1), || !motor.is_moving()));
    assert_eq!(motor.mode(), MotorMode::Stopped);

    thread::sleep(Duration::from_millis(200));
    let faults: Vec<_> = events
        .lock()
        .iter()
        .filter(|e| matches!(e.reason, TransitionReason::Fault(_)))
        .cloned()
        .collect();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].current, MotorMode::Stopped);

    // Nothing but the fail-safe stop after the fault.
    let writes = sim.writes();
    assert_eq!(writes.last(), Some(&SimWrite::Command(MotorCommand::Stop)));
    let count = sim.write_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sim.write_count(), count);
    assert_eq!(motor.snapshot().fault_count, 1);
}

#[test]
fn stop_is_idempotent() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    let before = sim.write_count();
    let first = motor.stop(true).unwrap();
    let second = motor.stop(true).unwrap();
    assert_eq!(first.mode, MotorMode::Stopped);
    assert_eq!(second.mode, MotorMode::Stopped);
    assert_eq!(sim.write_count(), before);
}

#[test]
fn stop_releases_blocked_rotate() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    let motor = Arc::new(motor);
    motor.set_speed(100.0).unwrap();
    let caller = {
        let motor = Arc::clone(&motor);
        thread::spawn(move || motor.rotate(3600.0, true).unwrap())
    };
    assert!(wait_for(Duration::from_secs(1), || motor.is_moving()));
    let snapshot = motor.stop(false).unwrap();
    assert_eq!(snapshot.mode, MotorMode::Stopped);
    assert!(matches!(caller.join().unwrap(), MoveOutcome::Stopped { .. }));
}

#[test]
fn stop_before_first_tick_cancels_pending_rotate() {
    // Two ticks a second: the rotate is still queued when the stop arrives.
    let sim = SimulatedMotor::new();
    let config = RegulatorConfig::default().with_rate_hz(2);
    let motor = Arc::new(RegulatedMotor::new(sim, MotorConfig::ev3_large(), config).unwrap());
    let events = record_events(&motor);
    let caller = {
        let motor = Arc::clone(&motor);
        thread::spawn(move || motor.rotate(360.0, true).unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    let snapshot = motor.stop(true).unwrap();

    assert_eq!(snapshot.mode, MotorMode::Stopped);
    let outcome = caller.join().unwrap();
    assert!(matches!(outcome, MoveOutcome::Stopped { .. }), "{outcome:?}");
    assert!(events.lock().is_empty());
}

#[test]
fn jammed_shaft_is_reported_as_stall() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    let events = record_events(&motor);
    sim.set_jammed(true);

    let outcome = motor.rotate(360.0, true).unwrap();
    assert!(matches!(outcome, MoveOutcome::Stalled { .. }), "{outcome:?}");
    assert!(motor.is_stalled());
    assert!(events
        .lock()
        .iter()
        .any(|e| e.reason == TransitionReason::Stalled));
    assert_eq!(sim.last_command(), MotorCommand::Stop);

    sim.set_jammed(false);
    let outcome = motor.rotate(45.0, true).unwrap();
    assert!(matches!(outcome, MoveOutcome::Completed { .. }), "{outcome:?}");
    assert!(!motor.is_stalled());
}

#[test]
fn timeout_ends_wait_but_not_motion() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    motor.set_speed(200.0).unwrap();
    let outcome = motor
        .rotate_timeout(3600.0, true, Duration::from_millis(100))
        .unwrap();
    assert_eq!(outcome, MoveOutcome::TimedOut);
    assert!(motor.is_moving());
    motor.stop(true).unwrap();
}

#[test]
fn invalid_arguments_are_rejected_before_dispatch() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    let writes = sim.write_count();

    assert!(matches!(
        motor.set_speed(-1.0),
        Err(MotorError::SpeedOutOfRange { .. })
    ));
    assert!(matches!(
        motor.set_speed(f64::NAN),
        Err(MotorError::SpeedOutOfRange { .. })
    ));
    assert!(matches!(
        motor.set_speed(motor.max_speed() + 1.0),
        Err(MotorError::SpeedOutOfRange { .. })
    ));
    assert!(matches!(
        motor.rotate(f64::INFINITY, true),
        Err(MotorError::InvalidTarget(_))
    ));
    motor.set_speed(0.0).unwrap();
    assert!(matches!(
        motor.rotate_to(10.0, false),
        Err(MotorError::InvalidTarget(_))
    ));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.write_count(), writes);
    assert_eq!(motor.snapshot().target, None);
}

#[test]
fn set_speed_retargets_running_motor() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    motor.set_speed(200.0).unwrap();
    motor.backward().unwrap();
    assert!(wait_for(Duration::from_secs(1), || sim.speed_sp() == -200));
    motor.set_speed(400.0).unwrap();
    assert!(wait_for(Duration::from_secs(1), || sim.speed_sp() == -400));
    motor.stop(true).unwrap();
}

#[test]
fn reset_tacho_count_zeroes_position() {
    let (motor, _sim) = start(MotorConfig::ev3_large());
    motor.set_speed(540.0).unwrap();
    motor.set_brake_on_completion(false);
    motor.rotate_to(120.0, true).unwrap();
    motor.reset_tacho_count().unwrap();
    assert!(motor.tacho_count().abs() <= 1, "at {}", motor.tacho_count());
}

#[test]
fn shutdown_stops_motor_and_joins_worker() {
    let (motor, sim) = start(MotorConfig::ev3_large());
    motor.forward().unwrap();
    assert!(wait_for(Duration::from_secs(1), || motor.is_moving()));
    let stats = motor.shutdown();
    assert!(stats.cycles_executed > 0);
    assert_eq!(sim.last_command(), MotorCommand::Stop);

    let count = sim.write_count();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.write_count(), count);
}

#[test]
fn invalid_configuration_is_refused() {
    let result = RegulatedMotor::new(
        SimulatedMotor::new(),
        MotorConfig::nxt().with_max_speed(-5.0),
        RegulatorConfig::default(),
    );
    assert!(matches!(result, Err(MotorError::InvalidConfig(_))));
}
