//! reelplay: timeline preview playback for mobile video editing.
//!
//! A project is an ordered list of clips (plus background audio). The
//! `PlaybackController` decodes video and audio on background threads, keeps
//! them in sync through the audio clock and presents frames on a
//! `FrameSurface`.

pub mod audio;
pub mod config;
pub mod core;
pub mod decode;
pub mod logging;
pub mod media;
pub mod playback;

pub use crate::config::PlayerConfig;
pub use crate::core::{AudioAsset, MediaAsset, Project, TimeRange};
pub use crate::media::{AudioOutput, FrameSurface, MediaBackend, SoftwareAudioOutput, SyntheticBackend};
pub use crate::playback::{PlaybackController, PlaybackError, PlayerEvent, ReadyState};
