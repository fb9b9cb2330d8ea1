use crate::error::MotorError;
use crate::hal::Polarity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Gains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

/// Per-model constants of a regulated motor. Built once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub move_gains: Gains,
    pub hold_gains: Gains,
    /// Degrees added to every position reading.
    pub encoder_offset: i32,
    /// Upper bound on commanded speed, deg/s.
    pub max_speed: f64,
    #[serde(default)]
    pub polarity: Polarity,
    #[serde(default = "default_counts_per_rot")]
    pub counts_per_rot: u32,
}

fn default_counts_per_rot() -> u32 {
    360
}

const LEGO_MOVE_GAINS: Gains = Gains::new(4.0, 0.04, 10.0);
const LEGO_HOLD_GAINS: Gains = Gains::new(2.0, 0.02, 8.0);

impl MotorConfig {
    /// NXT motor: 170 rpm nominal.
    pub const fn nxt() -> Self {
        Self::lego(170.0 * 360.0 / 60.0)
    }

    /// EV3 large motor: 175 rpm nominal.
    pub const fn ev3_large() -> Self {
        Self::lego(175.0 * 360.0 / 60.0)
    }

    /// EV3 medium motor: 260 rpm nominal.
    pub const fn ev3_medium() -> Self {
        Self::lego(260.0 * 360.0 / 60.0)
    }

    const fn lego(max_speed: f64) -> Self {
        Self {
            move_gains: LEGO_MOVE_GAINS,
            hold_gains: LEGO_HOLD_GAINS,
            encoder_offset: 0,
            max_speed,
            polarity: Polarity::Normal,
            counts_per_rot: 360,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "nxt" => Some(Self::nxt()),
            "ev3-large" | "ev3_large" => Some(Self::ev3_large()),
            "ev3-medium" | "ev3_medium" => Some(Self::ev3_medium()),
            _ => None,
        }
    }

    pub fn with_max_speed(mut self, max_speed: f64) -> Self {
        self.max_speed = max_speed;
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_encoder_offset(mut self, offset: i32) -> Self {
        self.encoder_offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), MotorError> {
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(MotorError::InvalidConfig(format!(
                "max_speed must be positive, got {}",
                self.max_speed
            )));
        }
        if self.counts_per_rot == 0 {
            return Err(MotorError::InvalidConfig(
                "counts_per_rot must be non-zero".to_string(),
            ));
        }
        for (name, gains) in [("move", self.move_gains), ("hold", self.hold_gains)] {
            let ok = [gains.kp, gains.ki, gains.kd]
                .iter()
                .all(|g| g.is_finite() && *g >= 0.0);
            if !ok {
                return Err(MotorError::InvalidConfig(format!(
                    "{name} gains must be finite and non-negative: {gains:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Tunables of the regulation loop itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    #[serde(with = "millis")]
    pub tick: Duration,
    /// A move is complete once |error| is within this many degrees...
    pub position_tolerance: f64,
    /// ...and |speed| is within this many deg/s.
    pub speed_tolerance: f64,
    /// Consecutive ticks without progress before a move is declared stalled.
    pub stall_ticks: u32,
    /// Progress below this many degrees counts as no progress.
    pub stall_epsilon: f64,
    /// Low-pass factor for differentiated speed, 0 < alpha <= 1.
    pub speed_filter: f64,
    #[serde(with = "millis")]
    pub min_sample_interval: Duration,
    #[serde(with = "millis")]
    pub min_pid_dt: Duration,
    #[serde(with = "millis")]
    pub wait_timeout: Duration,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            position_tolerance: 1.0,
            speed_tolerance: 20.0,
            stall_ticks: 13,
            stall_epsilon: 1.0,
            speed_filter: 0.2,
            min_sample_interval: Duration::from_millis(5),
            min_pid_dt: Duration::from_millis(1),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

impl RegulatorConfig {
    /// Tick period for the given rate, keeping the stall window at about 250 ms.
    pub fn with_rate_hz(mut self, hz: u32) -> Self {
        let hz = hz.max(1);
        self.tick = Duration::from_micros(1_000_000 / u64::from(hz));
        self.stall_ticks = (hz / 4).max(1) + 1;
        self
    }

    pub fn validate(&self) -> Result<(), MotorError> {
        let invalid = |msg: &str| Err(MotorError::InvalidConfig(msg.to_string()));
        if self.tick.is_zero() {
            return invalid("tick must be non-zero");
        }
        if self.stall_ticks == 0 {
            return invalid("stall_ticks must be at least 1");
        }
        let tolerances = [
            self.position_tolerance,
            self.speed_tolerance,
            self.stall_epsilon,
        ];
        if !tolerances.iter().all(|t| t.is_finite() && *t >= 0.0) {
            return invalid("tolerances must be finite and non-negative");
        }
        if !(self.speed_filter > 0.0 && self.speed_filter <= 1.0) {
            return invalid("speed_filter must be in (0, 1]");
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
