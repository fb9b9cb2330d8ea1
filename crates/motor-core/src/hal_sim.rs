use crate::error::DeviceIoError;
use crate::hal::{DeviceChannel, MotorCommand, Polarity, StateFlags, StopAction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Every attribute write the simulated driver received, in order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimWrite {
    Command(MotorCommand),
    Speed(i32),
    PositionSp(i32),
    StopAction(StopAction),
    Polarity(Polarity),
}

impl SimWrite {
    fn attribute(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Speed(_) => "speed_sp",
            Self::PositionSp(_) => "position_sp",
            Self::StopAction(_) => "stop_action",
            Self::Polarity(_) => "polarity",
        }
    }
}

/// Writes kept for inspection; older entries are dropped first.
pub const JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct SimState {
    position_deg: f64,
    speed_dps: f64,
    speed_sp: i32,
    position_sp: i32,
    command: MotorCommand,
    stop_action: StopAction,
    polarity: Polarity,

    max_speed_dps: f64,
    time_constant_s: f64,
    coast_time_constant_s: f64,

    native_speed: bool,
    jammed: bool,
    reads_until_fault: Option<u64>,
    faulted: bool,
    writes_until_fault: Option<u64>,
    write_faulted: bool,
    journal: VecDeque<SimWrite>,
    journal_capacity: usize,
    writes_total: usize,
}

impl SimState {
    fn run_target(&self) -> f64 {
        let sp = f64::from(self.speed_sp).clamp(-self.max_speed_dps, self.max_speed_dps);
        match self.command {
            MotorCommand::RunForever => sp,
            MotorCommand::RunToAbsPos | MotorCommand::RunToRelPos => {
                // On-board position loop: proportional approach, capped at speed_sp.
                let remaining = f64::from(self.position_sp) - self.position_deg;
                (remaining * 10.0).clamp(-sp.abs(), sp.abs())
            }
            MotorCommand::Stop | MotorCommand::Reset => 0.0,
        }
    }

    fn advance(&mut self, dt_s: f64) {
        if self.jammed {
            self.speed_dps = 0.0;
            return;
        }
        let tau = match (self.command, self.stop_action) {
            (MotorCommand::Stop, StopAction::Coast) => self.coast_time_constant_s,
            (MotorCommand::Stop, StopAction::Hold) => self.time_constant_s * 0.5,
            _ => self.time_constant_s,
        };

        // Integrate in 1 ms slices so long ticks stay stable.
        let mut remaining = dt_s;
        while remaining > 0.0 {
            let h = remaining.min(0.001);
            let target = self.run_target();
            self.speed_dps += (target - self.speed_dps) * (1.0 - (-h / tau).exp());
            self.position_deg += self.speed_dps * h;
            remaining -= h;
        }
    }

    fn check_read(&mut self, attribute: &str) -> Result<(), DeviceIoError> {
        if let Some(left) = self.reads_until_fault.as_mut() {
            if *left == 0 {
                self.faulted = true;
            } else {
                *left -= 1;
            }
        }
        if self.faulted {
            return Err(DeviceIoError::unavailable(attribute, "simulated device unplugged"));
        }
        Ok(())
    }

    fn check_write(&mut self, attribute: &str) -> Result<(), DeviceIoError> {
        if let Some(left) = self.writes_until_fault.as_mut() {
            if *left == 0 {
                self.write_faulted = true;
            } else {
                *left -= 1;
            }
        }
        if self.write_faulted {
            return Err(DeviceIoError::unavailable(attribute, "simulated device unplugged"));
        }
        Ok(())
    }

    fn log_write(&mut self, write: SimWrite) {
        self.writes_total += 1;
        if self.journal_capacity == 0 {
            return;
        }
        if self.journal.len() == self.journal_capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(write);
    }
}

/// Deterministic stand-in for a tacho motor.
///
/// Speed follows `speed_sp` with a first-order lag and position integrates
/// speed. Clone the [`SimHandle`] before handing the motor to a regulator to
/// inject jams or faults and to inspect the write journal.
#[derive(Debug)]
pub struct SimulatedMotor {
    state: Arc<Mutex<SimState>>,
}

/// Shared view of a [`SimulatedMotor`] for tests and demos.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMotor {
    pub fn new() -> Self {
        Self::with_max_speed(1050.0)
    }

    pub fn with_max_speed(max_speed_dps: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                position_deg: 0.0,
                speed_dps: 0.0,
                speed_sp: 0,
                position_sp: 0,
                command: MotorCommand::Stop,
                stop_action: StopAction::Coast,
                polarity: Polarity::Normal,
                max_speed_dps,
                time_constant_s: 0.03,
                coast_time_constant_s: 0.12,
                native_speed: true,
                jammed: false,
                reads_until_fault: None,
                faulted: false,
                writes_until_fault: None,
                write_faulted: false,
                journal: VecDeque::new(),
                journal_capacity: JOURNAL_CAPACITY,
                writes_total: 0,
            })),
        }
    }

    /// Report speed only through position changes, like drivers without a `speed` attribute.
    pub fn without_native_speed(self) -> Self {
        self.state.lock().native_speed = false;
        self
    }

    /// Keep at most `capacity` writes in the journal; zero disables it.
    pub fn with_journal_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.journal_capacity = capacity;
            while state.journal.len() > capacity {
                state.journal.pop_front();
            }
        }
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&self, write: SimWrite) -> Result<(), DeviceIoError> {
        let mut state = self.state.lock();
        state.check_write(write.attribute())?;
        state.log_write(write);
        match write {
            SimWrite::Command(MotorCommand::Reset) => {
                state.position_deg = 0.0;
                state.speed_dps = 0.0;
                state.speed_sp = 0;
                state.command = MotorCommand::Stop;
            }
            SimWrite::Command(MotorCommand::RunToRelPos) => {
                state.position_sp += state.position_deg.round() as i32;
                state.command = MotorCommand::RunToRelPos;
            }
            SimWrite::Command(command) => state.command = command,
            SimWrite::Speed(sp) => state.speed_sp = sp,
            SimWrite::PositionSp(sp) => state.position_sp = sp,
            SimWrite::StopAction(action) => state.stop_action = action,
            SimWrite::Polarity(polarity) => state.polarity = polarity,
        }
        Ok(())
    }
}

impl Default for SimulatedMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceChannel for SimulatedMotor {
    fn write_command(&mut self, command: MotorCommand) -> Result<(), DeviceIoError> {
        self.record(SimWrite::Command(command))
    }

    fn write_speed(&mut self, speed_sp: i32) -> Result<(), DeviceIoError> {
        self.record(SimWrite::Speed(speed_sp))
    }

    fn write_position_sp(&mut self, position_sp: i32) -> Result<(), DeviceIoError> {
        self.record(SimWrite::PositionSp(position_sp))
    }

    fn write_stop_action(&mut self, action: StopAction) -> Result<(), DeviceIoError> {
        self.record(SimWrite::StopAction(action))
    }

    fn write_polarity(&mut self, polarity: Polarity) -> Result<(), DeviceIoError> {
        self.record(SimWrite::Polarity(polarity))
    }

    fn read_position(&mut self) -> Result<i32, DeviceIoError> {
        let mut state = self.state.lock();
        state.check_read("position")?;
        let raw = state.position_deg.round() as i32;
        Ok(match state.polarity {
            Polarity::Normal => raw,
            Polarity::Inversed => -raw,
        })
    }

    fn read_speed(&mut self) -> Result<i32, DeviceIoError> {
        let mut state = self.state.lock();
        state.check_read("speed")?;
        let raw = state.speed_dps.round() as i32;
        Ok(match state.polarity {
            Polarity::Normal => raw,
            Polarity::Inversed => -raw,
        })
    }

    fn read_state(&mut self) -> Result<StateFlags, DeviceIoError> {
        let mut state = self.state.lock();
        state.check_read("state")?;
        let mut flags = StateFlags::empty();
        if state.command != MotorCommand::Stop {
            flags |= StateFlags::RUNNING;
            if state.jammed && state.speed_sp != 0 {
                flags |= StateFlags::STALLED;
            }
        } else if state.stop_action == StopAction::Hold {
            flags |= StateFlags::HOLDING;
        }
        Ok(flags)
    }

    fn has_native_speed(&self) -> bool {
        self.state.lock().native_speed
    }

    fn step(&mut self, dt: Duration) {
        self.state.lock().advance(dt.as_secs_f64());
    }
}

impl SimHandle {
    pub fn position(&self) -> f64 {
        self.state.lock().position_deg
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed_dps
    }

    /// Move the shaft by hand, e.g. to disturb a holding motor.
    pub fn set_position(&self, degrees: f64) {
        self.state.lock().position_deg = degrees;
    }

    /// Block the shaft: position stops changing whatever speed is commanded.
    pub fn set_jammed(&self, jammed: bool) {
        self.state.lock().jammed = jammed;
    }

    /// Let `reads` more attribute reads succeed, then fail every read.
    pub fn fail_reads_after(&self, reads: u64) {
        self.state.lock().reads_until_fault = Some(reads);
    }

    /// Let `writes` more attribute writes succeed, then fail every write.
    /// Failed writes change nothing and are not journaled.
    pub fn fail_writes_after(&self, writes: u64) {
        self.state.lock().writes_until_fault = Some(writes);
    }

    pub fn restore(&self) {
        let mut state = self.state.lock();
        state.reads_until_fault = None;
        state.faulted = false;
        state.writes_until_fault = None;
        state.write_faulted = false;
    }

    /// The most recent writes, oldest first.
    pub fn writes(&self) -> Vec<SimWrite> {
        self.state.lock().journal.iter().copied().collect()
    }

    /// Successful writes since creation, including those no longer journaled.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes_total
    }

    pub fn clear_writes(&self) {
        self.state.lock().journal.clear();
    }

    pub fn last_command(&self) -> MotorCommand {
        self.state.lock().command
    }

    pub fn speed_sp(&self) -> i32 {
        self.state.lock().speed_sp
    }
}
