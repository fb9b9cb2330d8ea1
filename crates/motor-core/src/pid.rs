//! PID correction for one control regime.
//!
//! `correction = kp * e + ki * ∫e dt + kd * de/dt`, with `dt` measured in
//! milliseconds: the gain tables in [`MotorConfig`](crate::MotorConfig) were
//! tuned against a millisecond clock.
//!
//! The integral is clamped to `±max_output / ki` so the integral term alone
//! can never exceed the output limit, and the final correction is clamped to
//! `±max_output`.

use crate::config::Gains;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PidController {
    gains: Gains,
    max_output: f64,
    min_dt: Duration,
    integral: f64,
    previous_error: Option<f64>,
}

impl PidController {
    pub fn new(gains: Gains, max_output: f64) -> Self {
        Self {
            gains,
            max_output: max_output.abs(),
            min_dt: Duration::from_millis(1),
            integral: 0.0,
            previous_error: None,
        }
    }

    /// Ticks shorter than `min_dt` contribute no derivative term.
    pub fn with_min_dt(mut self, min_dt: Duration) -> Self {
        self.min_dt = min_dt;
        self
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error.unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = None;
    }

    pub fn step(&mut self, target: f64, actual: f64, dt: Duration) -> f64 {
        if !target.is_finite() || !actual.is_finite() {
            return 0.0;
        }
        let dt_ms = dt.as_secs_f64() * 1_000.0;
        let error = target - actual;

        let integral_limit = if self.gains.ki > 0.0 {
            self.max_output / self.gains.ki
        } else {
            0.0
        };
        self.integral = (self.integral + error * dt_ms).clamp(-integral_limit, integral_limit);

        let derivative = match self.previous_error {
            Some(previous) if dt > self.min_dt && dt_ms > 0.0 => (error - previous) / dt_ms,
            _ => 0.0,
        };
        self.previous_error = Some(error);

        let correction =
            self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        if correction.is_nan() {
            return 0.0;
        }
        correction.clamp(-self.max_output, self.max_output)
    }
}
