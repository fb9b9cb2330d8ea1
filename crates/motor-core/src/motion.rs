use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Backward => -1.0,
        }
    }
}

/// What the regulation loop is asked to do. Speeds are magnitudes in deg/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotionTarget {
    RunForever {
        direction: Direction,
        speed: f64,
    },
    RotateBy {
        delta: f64,
        speed: f64,
        brake_on_completion: bool,
    },
    RotateTo {
        position: f64,
        speed: f64,
        brake_on_completion: bool,
    },
    Stop {
        brake: bool,
    },
}

impl MotionTarget {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }

    pub fn speed(&self) -> f64 {
        match self {
            Self::RunForever { speed, .. }
            | Self::RotateBy { speed, .. }
            | Self::RotateTo { speed, .. } => *speed,
            Self::Stop { .. } => 0.0,
        }
    }
}

/// Control regime of a regulated motor. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorMode {
    #[default]
    Stopped,
    Moving,
    Holding,
    Stalled,
}

impl MotorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Moving => "moving",
            Self::Holding => "holding",
            Self::Stalled => "stalled",
        }
    }

    /// Stable numeric code, used for gauges.
    pub fn code(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Moving => 1,
            Self::Holding => 2,
            Self::Stalled => 3,
        }
    }
}

/// How a blocking rotate ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveOutcome {
    /// Non-blocking call: the target was handed to the worker.
    InProgress,
    Completed { position: f64 },
    Stalled { position: f64 },
    /// Stopped before completion, by a stop command or a device fault.
    Stopped { position: f64 },
    /// Another command replaced this one.
    Superseded,
    /// The wait ended; the motor keeps moving.
    TimedOut,
}
