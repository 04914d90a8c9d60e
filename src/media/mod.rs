//! Media collaborators consumed by the decode pipeline.
//!
//! Container probing, demuxing and decoding sit behind `MediaBackend`; the
//! decode contexts only ever see `VideoDemuxer`/`AudioDemuxer` trait objects.
//! Audio devices sit behind `output::AudioOutput` and GPU uploads behind
//! `surface::FrameSurface`.
//!
//! Backends:
//! - `synthetic::SyntheticBackend`: deterministic in-memory media
//! - `ffmpeg::FfmpegBackend` (feature `ffmpeg`): real files via FFmpeg

use std::path::{Path, PathBuf};

use crate::audio::buffer::DecodedAudio;
use crate::audio::resample::{AudioFormat, Resampler};
use crate::core::project::MediaFileInfo;
use crate::decode::frame::DecodedPicture;
use crate::decode::stream_info::{AudioStreamInfo, IndexEntry, VideoStreamInfo};

pub mod backlog;
#[cfg(feature = "cpal")]
pub mod cpal_output;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod output;
pub mod surface;
pub mod synthetic;

pub use backlog::{Offer, PacketBacklog};
pub use output::{AudioDataCallback, AudioOutput, Filled, OutputError, SoftwareAudioOutput};
pub use surface::{FrameRenderer, FrameSurface, SurfaceHandle, SurfaceRequest};
pub use synthetic::SyntheticBackend;

/// Error type for demuxing and decoding
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("No {0} stream found")]
    StreamNotFound(&'static str),
    #[error("Codec not found: {0}")]
    CodecNotFound(String),
    #[error("Seek to {timestamp} failed: {reason}")]
    Seek { timestamp: i64, reason: String },
    #[error("Corrupt frame: {0}")]
    Corrupt(String),
    #[error("Decoder not opened")]
    NotOpened,
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DecodeError {
    /// A single bad frame; decoding can continue with the next packet
    pub fn is_transient(&self) -> bool {
        matches!(self, DecodeError::Corrupt(_))
    }
}

/// Error type for probing
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to probe {path}: {reason}")]
    Failed { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compressed packet read from a container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub discard: bool,
    pub data: Vec<u8>,
}

/// Reads container metadata without keeping the file open.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaFileInfo, ProbeError>;
}

/// An opened container positioned on its best video stream, paired with a
/// decoder for that stream.
pub trait VideoDemuxer: Send {
    fn stream(&self) -> &VideoStreamInfo;

    /// Seek index of the video stream (may be empty)
    fn index_entries(&self) -> Vec<IndexEntry>;

    /// Next packet of any stream; `Ok(None)` at end of file
    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError>;

    /// Feeds `packet` and returns at most one picture. `None` drains one
    /// buffered picture at end of stream.
    fn decode(&mut self, packet: Option<&Packet>) -> Result<Option<DecodedPicture>, DecodeError>;

    /// Seeks the video stream to `timestamp` (stream ticks). `backward`
    /// lands on the keyframe at or before the target.
    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError>;

    /// Drops pictures buffered inside the decoder
    fn flush(&mut self);
}

/// An opened container with a decoder for its best audio stream.
pub trait AudioDemuxer: Send {
    /// Short names of the detected container, comma separated
    fn format_name(&self) -> &str;

    /// `None` when the probe found no audio stream
    fn stream(&self) -> Option<&AudioStreamInfo>;

    /// Duration of the video stream in seconds, if there is one
    fn video_duration(&self) -> Option<f64>;

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError>;

    /// Decodes one audio packet; `Ok(None)` when it produced no samples
    fn decode(&mut self, packet: &Packet) -> Result<Option<DecodedAudio>, DecodeError>;

    fn seek(&mut self, timestamp: i64, backward: bool) -> Result<(), DecodeError>;

    fn flush(&mut self);
}

/// Factory for demuxers, shared by every decode service of a player.
pub trait MediaBackend: MediaProbe {
    fn open_video(&self, path: &Path) -> Result<Box<dyn VideoDemuxer>, DecodeError>;

    /// Opens `path` for audio, analysing at most `probe_size` bytes to
    /// discover streams.
    fn open_audio(&self, path: &Path, probe_size: usize) -> Result<Box<dyn AudioDemuxer>, DecodeError>;

    /// Converter from this backend's decoded audio to `target` PCM
    fn resampler(&self, target: AudioFormat) -> Box<dyn Resampler>;
}
