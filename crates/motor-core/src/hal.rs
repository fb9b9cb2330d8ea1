use crate::error::DeviceIoError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Values accepted by the `command` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    RunForever,
    RunToAbsPos,
    RunToRelPos,
    Stop,
    Reset,
}

impl MotorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunForever => "run-forever",
            Self::RunToAbsPos => "run-to-abs-pos",
            Self::RunToRelPos => "run-to-rel-pos",
            Self::Stop => "stop",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values accepted by the `stop_action` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Coast,
    Brake,
    Hold,
}

impl StopAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coast => "coast",
            Self::Brake => "brake",
            Self::Hold => "hold",
        }
    }
}

impl fmt::Display for StopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values accepted by the `polarity` attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Normal,
    Inversed,
}

impl Polarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Inversed => "inversed",
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Inversed => -1.0,
        }
    }
}

bitflags! {
    /// Flags reported by the `state` attribute.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StateFlags: u8 {
        const RUNNING = 1 << 0;
        const RAMPING = 1 << 1;
        const HOLDING = 1 << 2;
        const OVERLOADED = 1 << 3;
        const STALLED = 1 << 4;
    }
}

impl StateFlags {
    /// Parses the space separated token list the kernel writes, e.g. `running stalled`.
    /// Unknown tokens are ignored so newer drivers do not break older builds.
    pub fn parse_tokens(raw: &str) -> Self {
        raw.split_whitespace()
            .fold(Self::empty(), |flags, token| match token {
                "running" => flags | Self::RUNNING,
                "ramping" => flags | Self::RAMPING,
                "holding" => flags | Self::HOLDING,
                "overloaded" => flags | Self::OVERLOADED,
                "stalled" => flags | Self::STALLED,
                _ => flags,
            })
    }
}

/// Typed access to the kernel attributes of a single tacho motor.
///
/// One channel per actuator. The regulation worker owns it for the whole
/// lifetime of the motor; nothing else writes to it.
pub trait DeviceChannel: Send {
    fn write_command(&mut self, command: MotorCommand) -> Result<(), DeviceIoError>;
    fn write_speed(&mut self, speed_sp: i32) -> Result<(), DeviceIoError>;
    fn write_position_sp(&mut self, position_sp: i32) -> Result<(), DeviceIoError>;
    fn write_stop_action(&mut self, action: StopAction) -> Result<(), DeviceIoError>;
    fn write_polarity(&mut self, polarity: Polarity) -> Result<(), DeviceIoError>;
    fn read_position(&mut self) -> Result<i32, DeviceIoError>;
    fn read_speed(&mut self) -> Result<i32, DeviceIoError>;
    fn read_state(&mut self) -> Result<StateFlags, DeviceIoError>;

    /// Whether `read_speed` reports a usable measured speed.
    fn has_native_speed(&self) -> bool {
        true
    }

    /// Advance simulated hardware by `dt`. Real devices ignore it.
    fn step(&mut self, _dt: Duration) {}
}

impl<T: DeviceChannel + ?Sized> DeviceChannel for Box<T> {
    fn write_command(&mut self, command: MotorCommand) -> Result<(), DeviceIoError> {
        (**self).write_command(command)
    }

    fn write_speed(&mut self, speed_sp: i32) -> Result<(), DeviceIoError> {
        (**self).write_speed(speed_sp)
    }

    fn write_position_sp(&mut self, position_sp: i32) -> Result<(), DeviceIoError> {
        (**self).write_position_sp(position_sp)
    }

    fn write_stop_action(&mut self, action: StopAction) -> Result<(), DeviceIoError> {
        (**self).write_stop_action(action)
    }

    fn write_polarity(&mut self, polarity: Polarity) -> Result<(), DeviceIoError> {
        (**self).write_polarity(polarity)
    }

    fn read_position(&mut self) -> Result<i32, DeviceIoError> {
        (**self).read_position()
    }

    fn read_speed(&mut self) -> Result<i32, DeviceIoError> {
        (**self).read_speed()
    }

    fn read_state(&mut self) -> Result<StateFlags, DeviceIoError> {
        (**self).read_state()
    }

    fn has_native_speed(&self) -> bool {
        (**self).has_native_speed()
    }

    fn step(&mut self, dt: Duration) {
        (**self).step(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_tokens() {
        let flags = StateFlags::parse_tokens("running stalled\n");
        assert!(flags.contains(StateFlags::RUNNING | StateFlags::STALLED));
        assert!(!flags.contains(StateFlags::HOLDING));
        assert_eq!(StateFlags::parse_tokens(""), StateFlags::empty());
    }

    #[test]
    fn ignores_unknown_state_tokens() {
        assert_eq!(
            StateFlags::parse_tokens("holding warp-drive"),
            StateFlags::HOLDING
        );
    }

    #[test]
    fn command_tokens_match_driver() {
        assert_eq!(MotorCommand::RunToRelPos.to_string(), "run-to-rel-pos");
        assert_eq!(StopAction::Hold.as_str(), "hold");
        assert_eq!(Polarity::Inversed.sign(), -1.0);
    }
}
