//! Time representation for timeline playback.
//! Render positions are seconds (f64); container timestamps are integer
//! ticks in a stream time base and are rescaled through `Rational`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance used when matching a frame timestamp against a render position
pub const PTS_EPS: f64 = 1e-3;

/// Tolerance used for range checks on positions and durations
pub const TIME_EPS: f64 = 1e-3;

/// Tolerance for accepting the first frame of the timeline at position zero
pub const ZERO_FRAME_TOLERANCE: f64 = 0.005;

/// Ticks per second of the container-neutral time base (microseconds)
pub const TIME_BASE_TICKS: i64 = 1_000_000;

/// Time constants for conversions
pub mod constants {
    pub const MILLIS_PER_SECOND: f64 = 1_000.0;
    pub const MICROS_PER_SECOND: f64 = 1_000_000.0;
}

/// A rational number, used for stream time bases and frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Value as a float; zero when the denominator is zero
    #[inline]
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// True for 0/x and x/0
    #[inline]
    pub fn is_zero(self) -> bool {
        self.num == 0 || self.den == 0
    }

    /// Multiplicative inverse (e.g. frame rate to frame duration)
    #[inline]
    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(1, TIME_BASE_TICKS as i32)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Convert a tick count in `time_base` to seconds
#[inline]
pub fn ticks_to_seconds(ticks: i64, time_base: Rational) -> f64 {
    ticks as f64 * time_base.to_f64()
}

/// Convert seconds to a tick count in `time_base`, rounding down
#[inline]
pub fn seconds_to_ticks(seconds: f64, time_base: Rational) -> i64 {
    let tb = time_base.to_f64();
    if tb == 0.0 {
        return 0;
    }
    (seconds / tb).floor() as i64
}

/// Rescale `ticks` from one time base to another, rounding to nearest
#[inline]
pub fn rescale(ticks: i64, from: Rational, to: Rational) -> i64 {
    let mut num = from.num as i128 * to.den as i128;
    let mut den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    if den < 0 {
        num = -num;
        den = -den;
    }
    let scaled = ticks as i128 * num;
    let rounded = if scaled >= 0 {
        (scaled + den / 2) / den
    } else {
        (scaled - den / 2) / den
    };
    rounded as i64
}

/// Convert a position to a sample index at `sample_rate`
#[inline]
pub fn seconds_to_samples(seconds: f64, sample_rate: u32) -> i64 {
    (seconds * sample_rate as f64) as i64
}

/// Convert a sample index to a position at `sample_rate`
#[inline]
pub fn samples_to_seconds(samples: i64, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}

/// Convert a position to a frame index given a frame rate
#[inline]
pub fn to_frame_index(seconds: f64, fps: f64) -> usize {
    (seconds * fps + 1e-9).floor().max(0.0) as usize
}

/// Convert a frame index to a position given a frame rate
#[inline]
pub fn from_frame_index(frame_index: usize, fps: f64) -> f64 {
    frame_index as f64 / fps
}

/// Format a position as HH:MM:SS.mmm
pub fn format_time(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * constants::MILLIS_PER_SECOND).round() as i64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;

    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_conversion() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(seconds_to_ticks(1.5, tb), 135_000);
        assert!((ticks_to_seconds(135_000, tb) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_seconds_to_ticks_floors() {
        let tb = Rational::new(1, 30);
        assert_eq!(seconds_to_ticks(0.99, tb), 29);
        assert_eq!(seconds_to_ticks(-0.01, tb), -1);
    }

    #[test]
    fn test_rescale() {
        let from = Rational::new(1, 90_000);
        let to = Rational::new(1, 1_000_000);
        assert_eq!(rescale(90_000, from, to), 1_000_000);
        assert_eq!(rescale(3_000, from, to), 33_333);
        assert_eq!(rescale(-3_000, from, to), -33_333);
    }

    #[test]
    fn test_zero_time_base() {
        let tb = Rational::new(0, 1);
        assert!(tb.is_zero());
        assert_eq!(seconds_to_ticks(3.0, tb), 0);
        assert_eq!(Rational::new(1, 0).to_f64(), 0.0);
    }

    #[test]
    fn test_frame_index() {
        assert_eq!(to_frame_index(1.0, 30.0), 30);
        assert!((from_frame_index(30, 30.0) - 1.0).abs() < 1e-12);
        // Exact frame boundaries survive float error
        assert_eq!(to_frame_index(from_frame_index(7, 30.0), 30.0), 7);
        assert_eq!(to_frame_index(0.5 / 30.0, 30.0), 0);
    }

    #[test]
    fn test_samples_conversion() {
        assert_eq!(seconds_to_samples(1.0, 44_100), 44_100);
        assert!((samples_to_seconds(22_050, 44_100) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(3661.5), "01:01:01.500");
        assert_eq!(format_time(0.0), "00:00:00.000");
    }
}
