use clap::Parser;
use motor_core::{Gains, MotorConfig, MotorError, Polarity, RegulatorConfig};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: &str = "outA";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unknown motor model `{0}` (expected nxt, ev3-large or ev3-medium)")]
    UnknownModel(String),
    #[error("invalid command `{0}`")]
    InvalidStep(String),
    #[error(transparent)]
    Motor(#[from] MotorError),
}

/// Closed-loop control of a sysfs tacho motor
#[derive(Parser, Debug, Default)]
#[command(name = "motor-ctl")]
#[command(version)]
#[command(about = "Regulated motor controller for sysfs tacho motors")]
#[command(after_help = "COMMANDS:
    forward | backward          run at the current speed
    stop | brake                coast or brake to a stop
    speed:<DPS>                 set the speed for later commands
    rotate:<DEG>                rotate by DEG and wait for completion
    to:<DEG>                    rotate to absolute DEG and wait
    rotate!:<DEG> | to!:<DEG>   same, without waiting
    wait:<SECS>                 sleep
    reset                       zero the tacho count
    hold:on | hold:off          hold position after rotations

EXAMPLES:
    motor-ctl --simulate speed:720 rotate:360 to:0
    motor-ctl --port outB --metrics-addr 0.0.0.0:9090 forward wait:5 brake")]
pub struct Cli {
    /// TOML configuration file; command-line flags take precedence.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output port of the motor.
    #[arg(short, long)]
    pub port: Option<String>,

    /// Device class directory to search for the port.
    #[arg(long, value_name = "DIR")]
    pub class_root: Option<PathBuf>,

    /// Drive a simulated motor instead of sysfs.
    #[arg(short = 's', long)]
    pub simulate: bool,

    /// Motor model preset: nxt, ev3-large, ev3-medium.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Regulation rate in Hz.
    #[arg(long, value_name = "HZ")]
    pub rate: Option<u32>,

    /// Initial speed in deg/s.
    #[arg(long)]
    pub speed: Option<f64>,

    /// Send `reset` to the device before starting.
    #[arg(long)]
    pub reset_device: bool,

    /// Keep running for this many seconds after the commands finish.
    #[arg(long, value_name = "SECS")]
    pub run_seconds: Option<u64>,

    /// Output logs in JSON format.
    #[arg(long)]
    pub json_logs: bool,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9090).
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<String>,

    /// Append motor transitions and commands to this JSONL file.
    #[arg(long, value_name = "PATH")]
    pub audit_log: Option<PathBuf>,

    /// Commands to execute in order.
    #[arg(value_name = "COMMAND")]
    pub commands: Vec<String>,
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub motor: MotorSection,
    pub regulator: RegulatorConfig,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotorSection {
    pub port: Option<String>,
    pub class_root: Option<PathBuf>,
    pub simulate: bool,
    pub model: Option<String>,
    pub max_speed: Option<f64>,
    pub polarity: Option<Polarity>,
    pub encoder_offset: Option<i32>,
    pub move_gains: Option<Gains>,
    pub hold_gains: Option<Gains>,
    pub speed: Option<f64>,
    pub brake_on_completion: Option<bool>,
    pub rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_log: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSource {
    Simulated,
    Sysfs { class_root: PathBuf, port: String },
}

/// One scripted command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Forward,
    Backward,
    Stop { brake: bool },
    Speed(f64),
    Rotate { delta: f64, block: bool },
    RotateTo { position: f64, block: bool },
    Wait(Duration),
    ResetTacho,
    Hold(bool),
}

impl FromStr for Step {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidStep(s.to_string());
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let number = || -> Result<f64, ConfigError> {
            arg.and_then(|a| a.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(invalid)
        };
        let step = match (name, arg) {
            ("forward", None) => Step::Forward,
            ("backward", None) => Step::Backward,
            ("stop", None) => Step::Stop { brake: false },
            ("brake", None) => Step::Stop { brake: true },
            ("reset", None) => Step::ResetTacho,
            ("speed", Some(_)) => Step::Speed(number()?),
            ("rotate", Some(_)) => Step::Rotate {
                delta: number()?,
                block: true,
            },
            ("rotate!", Some(_)) => Step::Rotate {
                delta: number()?,
                block: false,
            },
            ("to", Some(_)) => Step::RotateTo {
                position: number()?,
                block: true,
            },
            ("to!", Some(_)) => Step::RotateTo {
                position: number()?,
                block: false,
            },
            ("wait", Some(_)) => {
                let secs = number()?;
                if secs < 0.0 {
                    return Err(invalid());
                }
                Step::Wait(Duration::from_secs_f64(secs))
            }
            ("hold", Some("on")) => Step::Hold(true),
            ("hold", Some("off")) => Step::Hold(false),
            _ => return Err(invalid()),
        };
        Ok(step)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Forward => write!(f, "forward"),
            Step::Backward => write!(f, "backward"),
            Step::Stop { brake: false } => write!(f, "stop"),
            Step::Stop { brake: true } => write!(f, "brake"),
            Step::Speed(dps) => write!(f, "speed:{dps}"),
            Step::Rotate { delta, block } => {
                write!(f, "rotate{}:{delta}", if *block { "" } else { "!" })
            }
            Step::RotateTo { position, block } => {
                write!(f, "to{}:{position}", if *block { "" } else { "!" })
            }
            Step::Wait(d) => write!(f, "wait:{}", d.as_secs_f64()),
            Step::ResetTacho => write!(f, "reset"),
            Step::Hold(on) => write!(f, "hold:{}", if *on { "on" } else { "off" }),
        }
    }
}

/// Settings after merging the config file with the command line.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub device: DeviceSource,
    pub model: String,
    pub motor: MotorConfig,
    pub regulator: RegulatorConfig,
    pub speed: Option<f64>,
    pub brake_on_completion: bool,
    pub reset_device: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub steps: Vec<Step>,
}

impl RuntimeConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let motor_section = file.motor;
        let model = cli
            .model
            .or(motor_section.model)
            .unwrap_or_else(|| "ev3-large".to_string());
        let mut motor =
            MotorConfig::preset(&model).ok_or_else(|| ConfigError::UnknownModel(model.clone()))?;
        if let Some(max_speed) = motor_section.max_speed {
            motor.max_speed = max_speed;
        }
        if let Some(polarity) = motor_section.polarity {
            motor.polarity = polarity;
        }
        if let Some(offset) = motor_section.encoder_offset {
            motor.encoder_offset = offset;
        }
        if let Some(gains) = motor_section.move_gains {
            motor.move_gains = gains;
        }
        if let Some(gains) = motor_section.hold_gains {
            motor.hold_gains = gains;
        }
        motor.validate()?;

        let mut regulator = file.regulator;
        if let Some(hz) = cli.rate.or(motor_section.rate) {
            regulator = regulator.with_rate_hz(hz);
        }
        regulator.validate()?;

        let device = if cli.simulate || motor_section.simulate {
            DeviceSource::Simulated
        } else {
            DeviceSource::Sysfs {
                class_root: cli
                    .class_root
                    .or(motor_section.class_root)
                    .unwrap_or_else(|| PathBuf::from(motor_io::TACHO_MOTOR_CLASS)),
                port: cli
                    .port
                    .or(motor_section.port)
                    .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            }
        };

        let steps = cli
            .commands
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<Step>, _>>()?;

        let telemetry = file.telemetry;
        Ok(Self {
            device,
            model,
            motor,
            regulator,
            speed: cli.speed.or(motor_section.speed),
            brake_on_completion: motor_section.brake_on_completion.unwrap_or(true),
            reset_device: cli.reset_device,
            run_seconds: cli.run_seconds,
            json_logs: cli.json_logs || telemetry.json_logs,
            log_file: cli.log_file.or(telemetry.log_file),
            metrics_addr: cli.metrics_addr.or(telemetry.metrics_addr),
            audit_path: cli.audit_log.or(telemetry.audit_log),
            steps,
        })
    }
}
