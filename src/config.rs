//! Player tuning.
//!
//! Every threshold of the decode and buffering pipeline lives here with the
//! values that work on phones; tests and embedders override them through
//! JSON or by constructing the structs directly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::resample::AudioFormat;
use crate::core::project::{MAX_LONG_EDGE, MAX_SHORT_EDGE};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Video decode service tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoDecodeConfig {
    /// Decoded frames buffered ahead of the render position
    pub queue_capacity: usize,
    /// A seek within the current GOP is skipped when the target is at least
    /// this many frames past the last decoded frame
    pub no_seek_safe_frames: u32,
    /// Frames older than `target - frame_duration - max_last_frame_bias`
    /// after a seek are dropped
    pub max_last_frame_bias: f64,
    /// Show the oldest due frame immediately when rendering lags
    pub latest_if_lagging: bool,
}

impl Default for VideoDecodeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            no_seek_safe_frames: 5,
            max_last_frame_bias: 0.1,
            latest_if_lagging: false,
        }
    }
}

/// Audio decode service tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDecodeConfig {
    pub format: AudioFormat,
    /// Samples (all channels) handed to the output per pull
    pub chunk_samples: usize,
    /// Ring buffer capacity in chunks
    pub ring_chunks: usize,
    /// Bytes analysed on the first open attempt
    pub min_probe_size: usize,
    /// Bytes analysed when the first attempt found no audio stream
    pub max_probe_size: usize,
    /// Window after the clip start in which stale decoded samples are dropped
    pub correction_window: f64,
    /// Silence (samples, all channels) substituted for a failed decode
    pub silence_samples: usize,
}

impl Default for AudioDecodeConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            chunk_samples: 2048,
            ring_chunks: 6,
            min_probe_size: 1024,
            max_probe_size: 1024 * 1024,
            correction_window: 0.05,
            silence_samples: 1024,
        }
    }
}

impl AudioDecodeConfig {
    /// Samples (all channels) mixed per decode tick, 10 ms of audio
    pub fn quantum_samples(&self) -> usize {
        (self.format.sample_rate as usize / 100) * self.format.channels as usize
    }

    pub fn ring_capacity(&self) -> usize {
        self.chunk_samples * self.ring_chunks
    }
}

/// Ready-state thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadyStateConfig {
    /// Buffered frames needed for `EnoughData`
    pub enough_video_frames: usize,
    /// Buffered audio needed for `EnoughData`
    pub enough_audio_ms: u64,
    /// Minimum time in a state before it may be downgraded
    pub min_dwell_ms: u64,
}

impl Default for ReadyStateConfig {
    fn default() -> Self {
        Self {
            enough_video_frames: 3,
            enough_audio_ms: 50,
            min_dwell_ms: 300,
        }
    }
}

impl ReadyStateConfig {
    pub fn min_dwell(&self) -> Duration {
        Duration::from_millis(self.min_dwell_ms)
    }
}

/// Limits applied when uploading frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub max_short_edge: u32,
    pub max_long_edge: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            max_short_edge: MAX_SHORT_EDGE,
            max_long_edge: MAX_LONG_EDGE,
        }
    }
}

/// Complete player configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub video: VideoDecodeConfig,
    pub audio: AudioDecodeConfig,
    pub ready: ReadyStateConfig,
    pub surface: SurfaceConfig,
}

impl PlayerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.video.queue_capacity == 0 {
            return Err(ConfigError::Invalid("video.queue_capacity must be > 0".into()));
        }
        if self.video.max_last_frame_bias < 0.0 {
            return Err(ConfigError::Invalid("video.max_last_frame_bias must be >= 0".into()));
        }
        let format = self.audio.format;
        if format.sample_rate < 100 || !(1..=2).contains(&format.channels) {
            return Err(ConfigError::Invalid(format!(
                "unsupported audio format {} Hz / {} channels",
                format.sample_rate, format.channels
            )));
        }
        if self.audio.chunk_samples == 0 || self.audio.chunk_samples % format.channels as usize != 0 {
            return Err(ConfigError::Invalid("audio.chunk_samples must be a non-zero multiple of channels".into()));
        }
        if self.audio.ring_capacity() < self.audio.quantum_samples() {
            return Err(ConfigError::Invalid("audio ring buffer smaller than one decode quantum".into()));
        }
        if self.audio.min_probe_size == 0 || self.audio.max_probe_size < self.audio.min_probe_size {
            return Err(ConfigError::Invalid("audio probe sizes out of order".into()));
        }
        Ok(())
    }
}
