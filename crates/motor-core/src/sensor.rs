use crate::error::{DeviceIoError, ModeUnavailableError};
use thiserror::Error;

/// Why a mode switch failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModeError {
    #[error(transparent)]
    Unavailable(#[from] ModeUnavailableError),
    #[error(transparent)]
    Device(#[from] DeviceIoError),
}

/// A device with named operating modes, such as an IR sensor that can
/// measure proximity, seek a beacon or read a remote.
pub trait ModeSelector {
    fn modes(&self) -> Vec<String>;

    fn current_mode(&self) -> Result<String, ModeError>;

    /// Switch to `name`. Unknown names fail without touching the device.
    fn switch_mode(&mut self, name: &str) -> Result<(), ModeError>;
}

/// In-memory mode selector over a fixed list.
#[derive(Debug, Clone)]
pub struct SensorModes {
    modes: Vec<String>,
    current: usize,
}

impl SensorModes {
    /// The first mode is active initially. `modes` must not be empty.
    pub fn new<I, S>(modes: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let modes: Vec<String> = modes.into_iter().map(Into::into).collect();
        if modes.is_empty() {
            return None;
        }
        Some(Self { modes, current: 0 })
    }

    /// EV3 infrared sensor.
    pub fn ir() -> Self {
        Self {
            modes: ["IR-PROX", "IR-SEEK", "IR-REMOTE"]
                .into_iter()
                .map(String::from)
                .collect(),
            current: 0,
        }
    }

    pub fn index_of(&self, name: &str) -> Result<usize, ModeUnavailableError> {
        self.modes
            .iter()
            .position(|m| m == name)
            .ok_or_else(|| ModeUnavailableError {
                requested: name.to_string(),
                available: self.modes.clone(),
            })
    }
}

impl ModeSelector for SensorModes {
    fn modes(&self) -> Vec<String> {
        self.modes.clone()
    }

    fn current_mode(&self) -> Result<String, ModeError> {
        Ok(self.modes[self.current].clone())
    }

    fn switch_mode(&mut self, name: &str) -> Result<(), ModeError> {
        self.current = self.index_of(name)?;
        Ok(())
    }
}
