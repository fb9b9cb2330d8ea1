use crate::config::{MotorConfig, RegulatorConfig};
use crate::error::DeviceIoError;
use crate::hal::{DeviceChannel, Polarity};
use std::time::{Duration, Instant};

/// One normalized tachometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TachoSample {
    pub position: f64,
    pub speed: f64,
    pub timestamp: Instant,
}

/// Converts raw encoder counts into degrees and deg/s.
///
/// Position is corrected for counts-per-rotation, polarity, the configured
/// encoder offset and the software zero set by [`rebase`](Self::rebase).
/// Speed comes from the driver when it reports one; otherwise it is the
/// low-pass filtered difference of successive positions.
#[derive(Debug, Clone)]
pub struct TachometerReader {
    degrees_per_count: f64,
    polarity: Polarity,
    offset: f64,
    zero: f64,
    alpha: f64,
    min_interval: Duration,
    last: Option<TachoSample>,
    /// Position and time the speed estimate was last differentiated from.
    reference: Option<(f64, Instant)>,
}

impl TachometerReader {
    pub fn new(motor: &MotorConfig, regulator: &RegulatorConfig) -> Self {
        let counts = motor.counts_per_rot.max(1);
        Self {
            degrees_per_count: 360.0 / f64::from(counts),
            polarity: motor.polarity,
            offset: f64::from(motor.encoder_offset),
            zero: 0.0,
            alpha: regulator.speed_filter.clamp(f64::EPSILON, 1.0),
            min_interval: regulator.min_sample_interval,
            last: None,
            reference: None,
        }
    }

    pub fn sample<C: DeviceChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        now: Instant,
    ) -> Result<TachoSample, DeviceIoError> {
        let raw = channel.read_position()?;
        let position = self.to_degrees(raw);

        let speed = if channel.has_native_speed() {
            let raw_speed = channel.read_speed()?;
            f64::from(raw_speed) * self.degrees_per_count * self.polarity.sign()
        } else {
            self.differentiate(position, now)
        };

        let sample = TachoSample {
            position,
            speed,
            timestamp: now,
        };
        self.last = Some(sample);
        Ok(sample)
    }

    /// Make the current position read as zero.
    pub fn rebase(&mut self, current: f64) {
        self.zero += current;
        if let Some(last) = self.last.as_mut() {
            last.position -= current;
        }
        if let Some((position, _)) = self.reference.as_mut() {
            *position -= current;
        }
    }

    pub fn last(&self) -> Option<TachoSample> {
        self.last
    }

    /// Inverse of the speed normalization: deg/s to the driver's `speed_sp` units.
    pub fn raw_speed(&self, degrees_per_sec: f64) -> i32 {
        (degrees_per_sec / self.degrees_per_count * self.polarity.sign()).round() as i32
    }

    fn to_degrees(&self, raw: i32) -> f64 {
        f64::from(raw) * self.degrees_per_count * self.polarity.sign() + self.offset - self.zero
    }

    /// Samples closer than `min_interval` to the reference reuse the last
    /// estimate and leave the reference in place, so a burst of close samples
    /// still yields a fresh estimate once enough time has passed.
    fn differentiate(&mut self, position: f64, now: Instant) -> f64 {
        let previous = self.last.map_or(0.0, |last| last.speed);
        let Some((ref_position, ref_time)) = self.reference else {
            self.reference = Some((position, now));
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(ref_time);
        if elapsed < self.min_interval {
            return previous;
        }
        self.reference = Some((position, now));
        let raw_speed = (position - ref_position) / elapsed.as_secs_f64();
        previous + self.alpha * (raw_speed - previous)
    }
}
