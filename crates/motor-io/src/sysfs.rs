//! Device attributes exposed by the kernel as files under `/sys/class`.
//!
//! Every attribute is a small text file: integers in decimal, enumerations
//! as single tokens, flag sets as space-separated tokens. Reads and writes
//! go straight to the file without caching or retries; the regulator
//! decides what a failure means.

use motor_core::{
    DeviceChannel, DeviceIoError, ModeError, ModeSelector, ModeUnavailableError, MotorCommand,
    Polarity, StateFlags, StopAction,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const TACHO_MOTOR_CLASS: &str = "/sys/class/tacho-motor";
pub const LEGO_SENSOR_CLASS: &str = "/sys/class/lego-sensor";

/// Text attributes of one device directory.
#[derive(Debug, Clone)]
pub struct AttributeDir {
    root: PathBuf,
}

impl AttributeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, attribute: &str) -> bool {
        self.root.join(attribute).is_file()
    }

    pub fn read(&self, attribute: &str) -> Result<String, DeviceIoError> {
        let path = self.root.join(attribute);
        let raw = fs::read_to_string(&path).map_err(|err| io_error(attribute, err))?;
        let value = raw.trim().to_string();
        trace!(attribute, value = %value, "read");
        Ok(value)
    }

    pub fn read_int(&self, attribute: &str) -> Result<i32, DeviceIoError> {
        let value = self.read(attribute)?;
        value
            .parse()
            .map_err(|_| DeviceIoError::malformed(attribute, value))
    }

    pub fn write(&self, attribute: &str, value: &str) -> Result<(), DeviceIoError> {
        trace!(attribute, value, "write");
        fs::write(self.root.join(attribute), value).map_err(|err| io_error(attribute, err))
    }

    pub fn write_int(&self, attribute: &str, value: i32) -> Result<(), DeviceIoError> {
        self.write(attribute, &value.to_string())
    }
}

fn io_error(attribute: &str, err: io::Error) -> DeviceIoError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => DeviceIoError::PermissionDenied {
            attribute: attribute.to_string(),
        },
        io::ErrorKind::InvalidData => DeviceIoError::malformed(attribute, err.to_string()),
        _ => DeviceIoError::unavailable(attribute, err.to_string()),
    }
}

/// Find the device of `class_root` whose `address` names `port`.
///
/// Addresses look like `ev3-ports:outA` or `in1:i2c1`; `port` matches
/// either the whole address or its last `:`-separated component.
pub fn find_device(class_root: &Path, port: &str) -> Result<PathBuf, DeviceIoError> {
    let entries = fs::read_dir(class_root).map_err(|err| {
        DeviceIoError::unavailable(class_root.display().to_string(), err.to_string())
    })?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    candidates.sort();

    for dir in candidates {
        let Ok(address) = AttributeDir::new(&dir).read("address") else {
            continue;
        };
        let matches = address == port || address.rsplit(':').next() == Some(port);
        if matches {
            debug!(port, path = %dir.display(), "device found");
            return Ok(dir);
        }
    }
    Err(DeviceIoError::unavailable(
        "address",
        format!("no device on port {port} under {}", class_root.display()),
    ))
}

/// A tacho motor driven through its sysfs attribute directory.
#[derive(Debug)]
pub struct SysfsMotor {
    attrs: AttributeDir,
    native_speed: bool,
    counts_per_rot: Option<u32>,
}

impl SysfsMotor {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DeviceIoError> {
        let attrs = AttributeDir::new(root);
        // Fails early on a directory that is not a motor.
        attrs.read_int("position")?;
        let native_speed = attrs.exists("speed");
        let counts_per_rot = match attrs.read_int("count_per_rot") {
            Ok(counts) if counts > 0 => Some(counts as u32),
            _ => None,
        };
        debug!(
            path = %attrs.path().display(),
            native_speed,
            counts_per_rot,
            "motor opened"
        );
        Ok(Self {
            attrs,
            native_speed,
            counts_per_rot,
        })
    }

    /// Open the motor connected to `port` (e.g. `outA`).
    pub fn find(class_root: &Path, port: &str) -> Result<Self, DeviceIoError> {
        Self::open(find_device(class_root, port)?)
    }

    pub fn path(&self) -> &Path {
        self.attrs.path()
    }

    /// Encoder resolution reported by the driver, if any.
    pub fn counts_per_rot(&self) -> Option<u32> {
        self.counts_per_rot
    }

    pub fn driver_name(&self) -> Option<String> {
        self.attrs.read("driver_name").ok()
    }

    /// Stop the motor and restore every attribute to its driver default.
    pub fn reset(&mut self) -> Result<(), DeviceIoError> {
        self.write_command(MotorCommand::Reset)
    }
}

impl DeviceChannel for SysfsMotor {
    fn write_command(&mut self, command: MotorCommand) -> Result<(), DeviceIoError> {
        self.attrs.write("command", command.as_str())
    }

    fn write_speed(&mut self, speed_sp: i32) -> Result<(), DeviceIoError> {
        self.attrs.write_int("speed_sp", speed_sp)
    }

    fn write_position_sp(&mut self, position_sp: i32) -> Result<(), DeviceIoError> {
        self.attrs.write_int("position_sp", position_sp)
    }

    fn write_stop_action(&mut self, action: StopAction) -> Result<(), DeviceIoError> {
        self.attrs.write("stop_action", action.as_str())
    }

    fn write_polarity(&mut self, polarity: Polarity) -> Result<(), DeviceIoError> {
        self.attrs.write("polarity", polarity.as_str())
    }

    fn read_position(&mut self) -> Result<i32, DeviceIoError> {
        self.attrs.read_int("position")
    }

    fn read_speed(&mut self) -> Result<i32, DeviceIoError> {
        self.attrs.read_int("speed")
    }

    fn read_state(&mut self) -> Result<StateFlags, DeviceIoError> {
        self.attrs.read("state").map(|raw| StateFlags::parse_tokens(&raw))
    }

    fn has_native_speed(&self) -> bool {
        self.native_speed
    }
}

/// Mode switching for a sensor exposing `modes` and `mode` attributes.
#[derive(Debug)]
pub struct SysfsModeSelector {
    attrs: AttributeDir,
    modes: Vec<String>,
}

impl SysfsModeSelector {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DeviceIoError> {
        let attrs = AttributeDir::new(root);
        let modes = attrs
            .read("modes")?
            .split_whitespace()
            .map(String::from)
            .collect();
        Ok(Self { attrs, modes })
    }

    pub fn find(class_root: &Path, port: &str) -> Result<Self, DeviceIoError> {
        Self::open(find_device(class_root, port)?)
    }
}

impl ModeSelector for SysfsModeSelector {
    fn modes(&self) -> Vec<String> {
        self.modes.clone()
    }

    fn current_mode(&self) -> Result<String, ModeError> {
        Ok(self.attrs.read("mode")?)
    }

    fn switch_mode(&mut self, name: &str) -> Result<(), ModeError> {
        if !self.modes.iter().any(|m| m == name) {
            return Err(ModeUnavailableError {
                requested: name.to_string(),
                available: self.modes.clone(),
            }
            .into());
        }
        self.attrs.write("mode", name)?;
        debug!(mode = name, "sensor mode switched");
        Ok(())
    }
}
