pub mod config;
pub mod error;
pub mod hal;
#[cfg(any(test, feature = "simulation"))]
pub mod hal_sim;
pub mod listener;
pub mod motion;
pub mod motor;
pub mod pid;
pub mod regulator;
pub mod sensor;
pub mod sync;
pub mod tacho;
pub mod timebase;

pub use config::{Gains, MotorConfig, RegulatorConfig};
pub use error::{DeviceIoError, ModeUnavailableError, MotorError};
pub use hal::{DeviceChannel, MotorCommand, Polarity, StateFlags, StopAction};
#[cfg(any(test, feature = "simulation"))]
pub use hal_sim::{SimHandle, SimWrite, SimulatedMotor, JOURNAL_CAPACITY};
pub use listener::{ListenerRegistry, MoveListener, TransitionEvent, TransitionReason};
pub use motion::{Direction, MotionTarget, MotorMode, MoveOutcome};
pub use motor::RegulatedMotor;
pub use pid::PidController;
pub use regulator::{ExecutionStats, MotionRegulator};
pub use sensor::{ModeError, ModeSelector, SensorModes};
pub use sync::{MotorExchange, MotorSnapshot, PendingCommands, PendingTarget, WaitResult};
pub use tacho::{TachoSample, TachometerReader};
pub use timebase::TimeBase;
