//! Audio pipeline: per-file decoding, format conversion, mixing and the ring
//! buffer drained by the output callback.

pub mod buffer;
pub mod context;
pub mod mixer;
pub mod resample;
pub mod service;

pub use buffer::{AudioRingBuffer, DecodedAudio, SampleFormat};
pub use context::AudioDecodeContext;
pub use resample::{AudioFormat, LinearResampler, Resampler};
pub use service::AudioDecodeService;
