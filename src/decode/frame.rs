//! Decoded video pictures and the units handed from the decode thread to the
//! render path.

use std::path::PathBuf;

/// Pixel layout of a decoded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgba,
    Bgra,
    Gray8,
    Other,
}

/// One image plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// Decoded picture as produced by a backend, timestamps still in stream ticks
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
    pub pts: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
}

impl DecodedPicture {
    /// Presentation timestamp, falling back to the best-effort estimate
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.best_effort_timestamp)
    }
}

/// A picture positioned on the project timeline.
///
/// Ownership moves from the decode thread through the frame queue to exactly
/// one consumer. A unit without a picture marks the end of the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrameUnit {
    pub picture: Option<DecodedPicture>,
    pub timestamp: f64,     // Project seconds
    pub file: PathBuf,
    pub asset_index: usize,
}

impl DecodedFrameUnit {
    pub fn new(picture: DecodedPicture, timestamp: f64, file: PathBuf, asset_index: usize) -> Self {
        Self {
            picture: Some(picture),
            timestamp,
            file,
            asset_index,
        }
    }

    /// Sentinel queued after the last frame of the timeline. It sorts after
    /// every real frame and is never returned to the render path.
    pub fn end_of_stream(file: PathBuf, asset_index: usize) -> Self {
        Self {
            picture: None,
            timestamp: f64::INFINITY,
            file,
            asset_index,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.picture.is_none()
    }
}
