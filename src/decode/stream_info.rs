//! Stream metadata reported by an opened demuxer.

use crate::audio::buffer::SampleFormat;
use crate::core::time::Rational;

/// Video stream parameters
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    pub avg_frame_rate: Rational,
    pub first_dts: Option<i64>,  // In `time_base` ticks
    pub duration: i64,           // In `time_base` ticks, <= 0 when unknown
    pub width: u32,
    pub height: u32,
}

impl VideoStreamInfo {
    /// Average frame rate, zero when unknown
    pub fn fps(&self) -> f64 {
        self.avg_frame_rate.to_f64()
    }
}

/// Audio stream parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    pub duration: Option<i64>,   // In `time_base` ticks
    pub start_time: Option<i64>, // In `time_base` ticks
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub planar: bool,
}

/// One entry of a container's seek index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,   // dts in stream ticks
    pub keyframe: bool,
    pub discard: bool,
}
