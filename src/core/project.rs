//! Project model: the ordered media assets the preview plays back, background
//! audio assets mixed over them, and metadata derived by probing.
//!
//! A project is replaced wholesale on every structural edit, so everything here
//! is plain data (`Clone`, serde) plus pure helpers that compare two projects.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::time::{Rational, TIME_EPS};
use crate::media::MediaProbe;

/// Maximum short edge of the preview output
pub const MAX_SHORT_EDGE: u32 = 720;
/// Maximum long edge of the preview output
pub const MAX_LONG_EDGE: u32 = 1600;
/// Frame rate used when no video stream reports one
pub const DEFAULT_FPS: f64 = 30.0;
/// Upper bound on the preview frame rate
pub const MAX_FPS: f64 = 30.0;

static NEXT_PROJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Error type for project loading and serialization
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Invalid project JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to read project: {0}")]
    Io(#[from] std::io::Error),
}

/// Half-open range `[start, start + duration)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn new(start: f64, duration: f64) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Kind of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Video,
    Audio,
    Data,
    Subtitle,
    Attachment,
    #[default]
    Unknown,
}

/// Per-stream probe result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbedStream {
    pub codec_type: CodecType,
    pub width: u32,
    pub height: u32,
    pub rotation: i32,                    // From the container's "rotate" tag
    pub frame_rate: Rational,             // Guessed frame rate
    pub sample_aspect_ratio: Rational,    // 0/x when unknown
}

/// Cached probe result for one media file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFileInfo {
    pub path: PathBuf,
    pub format_name: String,
    pub duration: f64,                    // Video stream duration, else shortest stream
    pub streams: Vec<ProbedStream>,
    pub video_stream_index: Option<usize>,
    pub audio_stream_index: Option<usize>,
}

impl Default for MediaFileInfo {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            format_name: "unknown".to_string(),
            duration: 0.0,
            streams: Vec::new(),
            video_stream_index: None,
            audio_stream_index: None,
        }
    }
}

impl MediaFileInfo {
    /// Placeholder for a file that failed to probe; plays back as zero length.
    pub fn unprobed(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Self::default()
        }
    }

    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&ProbedStream> {
        self.streams.iter().find(|s| s.codec_type == CodecType::Video)
    }
}

fn default_volume() -> f32 {
    1.0
}

/// One clip on the main (video) track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub asset_id: u64,
    pub asset_path: PathBuf,
    #[serde(default = "default_volume")]
    pub volume: f32,                      // 0.0 mutes the asset
    #[serde(default)]
    pub clip_range: Option<TimeRange>,    // Trim in asset-local seconds
    #[serde(default)]
    pub rotation: i32,                    // User rotation in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<MediaFileInfo>,
}

impl MediaAsset {
    pub fn new(asset_id: u64, asset_path: impl Into<PathBuf>) -> Self {
        Self {
            asset_id,
            asset_path: asset_path.into(),
            volume: 1.0,
            clip_range: None,
            rotation: 0,
            file_info: None,
        }
    }

    pub fn with_clip_range(mut self, clip_range: TimeRange) -> Self {
        self.clip_range = Some(clip_range);
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Returns the cached probe result, probing again when it is missing or
    /// was taken for a different path. Probe failures are cached as an
    /// unprobed (zero-length) file.
    pub fn ensure_file_info<P: MediaProbe + ?Sized>(&mut self, probe: &P) -> &MediaFileInfo {
        let stale = match &self.file_info {
            None => true,
            Some(info) => info.path.as_os_str().is_empty() || info.path != self.asset_path,
        };
        if stale {
            let info = probe.probe(&self.asset_path).unwrap_or_else(|e| {
                tracing::warn!(path = %self.asset_path.display(), error = %e, "probe failed, asset skipped");
                MediaFileInfo::unprobed(&self.asset_path)
            });
            self.file_info = Some(info);
        }
        self.file_info.get_or_insert_with(MediaFileInfo::default)
    }

    /// Probed file duration, zero when unknown
    pub fn file_duration(&self) -> f64 {
        self.file_info.as_ref().map_or(0.0, |info| info.duration)
    }

    /// Portion of the file that plays, clamped to the file
    pub fn clipped_range(&self) -> TimeRange {
        clamp_clip(self.clip_range, self.file_duration())
    }

    /// Length of this asset's segment on the timeline
    pub fn display_duration(&self) -> f64 {
        self.clipped_range().duration
    }

    /// Container rotation plus user rotation, normalized to [0, 360)
    pub fn rotation(&self) -> i32 {
        let nature = self
            .file_info
            .as_ref()
            .and_then(|info| info.video_stream())
            .map_or(0, |s| s.rotation);
        normalize_rotation(nature + self.rotation)
    }
}

/// Background audio laid over the main track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub asset_id: u64,
    pub asset_path: PathBuf,
    #[serde(default = "default_volume")]
    pub volume: f32,
    pub display_range: TimeRange,         // Where it plays on the timeline
    #[serde(default)]
    pub clip_range: Option<TimeRange>,    // Asset-local trim
    #[serde(default)]
    pub repeat: bool,                     // Loop the clip over the display range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<MediaFileInfo>,
}

impl AudioAsset {
    pub fn new(asset_id: u64, asset_path: impl Into<PathBuf>, display_range: TimeRange) -> Self {
        Self {
            asset_id,
            asset_path: asset_path.into(),
            volume: 1.0,
            display_range,
            clip_range: None,
            repeat: false,
            file_info: None,
        }
    }

    pub fn ensure_file_info<P: MediaProbe + ?Sized>(&mut self, probe: &P) -> &MediaFileInfo {
        let stale = match &self.file_info {
            None => true,
            Some(info) => info.path != self.asset_path,
        };
        if stale {
            let info = probe.probe(&self.asset_path).unwrap_or_else(|e| {
                tracing::warn!(path = %self.asset_path.display(), error = %e, "probe failed, audio asset skipped");
                MediaFileInfo::unprobed(&self.asset_path)
            });
            self.file_info = Some(info);
        }
        self.file_info.get_or_insert_with(MediaFileInfo::default)
    }

    pub fn clipped_range(&self) -> TimeRange {
        let duration = self.file_info.as_ref().map_or(0.0, |info| info.duration);
        clamp_clip(self.clip_range, duration)
    }
}

/// Metadata derived from the assets by `Project::load`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivateData {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub input_asset_count: usize,
}

/// An editing project as seen by the player
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub project_id: u64,
    pub media_assets: Vec<MediaAsset>,
    pub audio_assets: Vec<AudioAsset>,
    pub private_data: PrivateData,
}

impl Project {
    /// Creates an empty project with a fresh id
    pub fn new() -> Self {
        Self {
            project_id: NEXT_PROJECT_ID.fetch_add(1, Ordering::Relaxed),
            ..Self::default()
        }
    }

    pub fn with_media_assets(assets: Vec<MediaAsset>) -> Self {
        Self {
            media_assets: assets,
            ..Self::new()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ProjectError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ProjectError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ProjectError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Probes every asset (reusing valid cached results) and derives the
    /// duration, output dimensions and frame rate.
    pub fn load<P: MediaProbe + ?Sized>(&mut self, probe: &P) {
        self.private_data.input_asset_count = self.media_assets.len();
        for asset in &mut self.media_assets {
            asset.ensure_file_info(probe);
        }
        for asset in &mut self.audio_assets {
            asset.ensure_file_info(probe);
        }
        self.calculate_duration_and_dimension();
    }

    /// Recomputes `private_data` from the cached probe results
    pub fn calculate_duration_and_dimension(&mut self) {
        let (width, height, fps) = self.unlimited_dimension_and_fps();
        let (width, height) = limit_width_and_height(width, height, MAX_SHORT_EDGE, MAX_LONG_EDGE);
        self.private_data.duration = self.media_assets.iter().map(|a| a.display_duration()).sum();
        self.private_data.width = width;
        self.private_data.height = height;
        self.private_data.fps = fps;
        tracing::debug!(
            project_id = self.project_id,
            duration = self.private_data.duration,
            width,
            height,
            fps,
            "project metadata derived"
        );
    }

    pub fn duration(&self) -> f64 {
        self.private_data.duration
    }

    pub fn fps(&self) -> f64 {
        if self.private_data.fps > TIME_EPS {
            self.private_data.fps
        } else {
            DEFAULT_FPS
        }
    }

    /// Dimension of the first video stream (sample-aspect corrected and
    /// rotated), and the highest frame rate of any video stream capped at 30.
    fn unlimited_dimension_and_fps(&self) -> (u32, u32, f64) {
        let mut size: Option<(u32, u32)> = None;
        let mut max_fps: f64 = -1.0;

        for asset in &self.media_assets {
            let Some(stream) = asset.file_info.as_ref().and_then(|i| i.video_stream()) else {
                continue;
            };
            let (mut w, mut h) = (stream.width, stream.height);
            let sar = stream.sample_aspect_ratio;
            if !sar.is_zero() {
                if sar.den > sar.num {
                    w = (w as i64 * sar.num as i64 / sar.den as i64) as u32;
                    w += w % 2;
                } else {
                    h = (h as i64 * sar.den as i64 / sar.num as i64) as u32;
                    h += h % 2;
                }
            }
            let rotation = asset.rotation();
            if rotation == 90 || rotation == 270 {
                std::mem::swap(&mut w, &mut h);
            }
            max_fps = max_fps.max(stream.frame_rate.to_f64());
            if size.is_none() && w > 0 {
                size = Some((w, h));
            }
        }

        let fps = if max_fps < TIME_EPS { DEFAULT_FPS } else { max_fps.min(MAX_FPS) };
        let (w, h) = size.unwrap_or((0, 0));
        (w, h, fps)
    }
}

fn clamp_clip(clip: Option<TimeRange>, file_duration: f64) -> TimeRange {
    match clip {
        None => TimeRange::new(0.0, file_duration.max(0.0)),
        Some(range) => {
            let start = range.start.clamp(0.0, file_duration.max(0.0));
            let end = range.end().clamp(start, file_duration.max(0.0));
            TimeRange::new(start, end - start)
        }
    }
}

/// Normalizes degrees into [0, 360)
pub fn normalize_rotation(degrees: i32) -> i32 {
    degrees.rem_euclid(360)
}

/// Scales `(width, height)` down to fit the edge limits, keeping the aspect
/// ratio. Results are rounded up to even values.
pub fn limit_width_and_height(width: u32, height: u32, max_short_edge: u32, max_long_edge: u32) -> (u32, u32) {
    let short_edge = width.min(height);
    let long_edge = width.max(height);

    let (mut w, mut h) = if short_edge > max_short_edge || long_edge > max_long_edge {
        let ratio = (max_short_edge as f64 / short_edge as f64).min(max_long_edge as f64 / long_edge as f64);
        // Height rounds up so no black margin shows at the top and bottom
        ((width as f64 * ratio) as u32, (height as f64 * ratio).ceil() as u32)
    } else {
        (width, height)
    };
    w += w % 2;
    h += h % 2;
    (w, h)
}

/// True when the asset list changed shape: count, project identity or any path.
pub fn is_timeline_changed(old: &Project, new: &Project) -> bool {
    if old.media_assets.len() != new.media_assets.len() || old.project_id != new.project_id {
        return true;
    }
    old.media_assets
        .iter()
        .zip(&new.media_assets)
        .any(|(a, b)| a.asset_path != b.asset_path)
}

/// True when the audio decoders need rebuilding (shape, trims or the
/// background audio list changed).
pub fn is_audio_assets_changed(old: &Project, new: &Project) -> bool {
    if is_timeline_changed(old, new) {
        return true;
    }
    let media_changed = old
        .media_assets
        .iter()
        .zip(&new.media_assets)
        .any(|(a, b)| a.asset_id != b.asset_id || a.clip_range != b.clip_range);
    if media_changed || old.audio_assets.len() != new.audio_assets.len() {
        return true;
    }
    old.audio_assets.iter().zip(&new.audio_assets).any(|(a, b)| {
        a.asset_id != b.asset_id
            || a.asset_path != b.asset_path
            || a.display_range != b.display_range
            || a.clip_range != b.clip_range
            || a.repeat != b.repeat
    })
}

/// True when any asset volume changed by more than 1e-3.
pub fn is_audio_volume_changed(old: &Project, new: &Project) -> bool {
    if old.media_assets.len() != new.media_assets.len() || old.audio_assets.len() != new.audio_assets.len() {
        return true;
    }
    let media = old
        .media_assets
        .iter()
        .zip(&new.media_assets)
        .any(|(a, b)| (a.volume - b.volume).abs() > 1e-3);
    let audio = old
        .audio_assets
        .iter()
        .zip(&new.audio_assets)
        .any(|(a, b)| (a.volume - b.volume).abs() > 1e-3);
    media || audio
}

/// Drops cached probe results of assets whose id changed at the same index.
pub fn clear_file_info_if_asset_id_changed(project: &mut Project, old: &Project) {
    for (asset, old_asset) in project.media_assets.iter_mut().zip(&old.media_assets) {
        if asset.asset_id != old_asset.asset_id {
            asset.file_info = None;
        }
    }
}
