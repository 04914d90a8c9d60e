//! Frame presentation.
//!
//! The GPU side is a `FrameSurface` collaborator: it receives decoded
//! pictures with the asset rotation and the edge limits and hands back an
//! opaque handle. `FrameRenderer` keeps the frame currently on screen and
//! releases the previous handle once a new frame is uploaded.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SurfaceConfig;
use crate::core::project::limit_width_and_height;
use crate::decode::frame::{DecodedFrameUnit, DecodedPicture};

/// Error type for frame uploads
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("Invalid picture: {0}")]
    InvalidPicture(String),
    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Opaque reference to an uploaded texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Everything a surface needs to present one picture
#[derive(Debug, Clone, Copy)]
pub struct SurfaceRequest<'a> {
    pub picture: &'a DecodedPicture,
    /// Clockwise degrees, one of 0/90/180/270
    pub rotation: i32,
    pub max_short_edge: u32,
    pub max_long_edge: u32,
}

impl SurfaceRequest<'_> {
    /// Displayed size after rotation and edge limits
    pub fn output_size(&self) -> (u32, u32) {
        let (w, h) = (self.picture.width, self.picture.height);
        let (w, h) = if self.rotation % 180 == 0 { (w, h) } else { (h, w) };
        limit_width_and_height(w, h, self.max_short_edge, self.max_long_edge)
    }
}

/// GPU texture sink
pub trait FrameSurface: Send {
    fn upload(&mut self, request: SurfaceRequest<'_>) -> Result<SurfaceHandle, SurfaceError>;

    fn release(&mut self, handle: SurfaceHandle);
}

/// The frame currently presented
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShownFrame {
    pub handle: SurfaceHandle,
    pub timestamp: f64,
    pub asset_index: usize,
}

/// Presents decoded frames on a `FrameSurface`
pub struct FrameRenderer {
    surface: Box<dyn FrameSurface>,
    config: SurfaceConfig,
    current: Option<ShownFrame>,
}

impl FrameRenderer {
    pub fn new(surface: Box<dyn FrameSurface>, config: SurfaceConfig) -> Self {
        Self {
            surface,
            config,
            current: None,
        }
    }

    /// Uploads `unit` rotated by `rotation` degrees and replaces the shown frame
    pub fn show(&mut self, unit: &DecodedFrameUnit, rotation: i32) -> Result<ShownFrame, SurfaceError> {
        let picture = unit
            .picture
            .as_ref()
            .ok_or_else(|| SurfaceError::InvalidPicture("end-of-stream marker".into()))?;
        if picture.width == 0 || picture.height == 0 {
            return Err(SurfaceError::InvalidPicture(format!(
                "zero dimensions {}x{}",
                picture.width, picture.height
            )));
        }

        let handle = self.surface.upload(SurfaceRequest {
            picture,
            rotation,
            max_short_edge: self.config.max_short_edge,
            max_long_edge: self.config.max_long_edge,
        })?;
        let shown = ShownFrame {
            handle,
            timestamp: unit.timestamp,
            asset_index: unit.asset_index,
        };
        if let Some(previous) = self.current.replace(shown) {
            self.surface.release(previous.handle);
        }
        tracing::trace!(timestamp = unit.timestamp, asset_index = unit.asset_index, "frame shown");
        Ok(shown)
    }

    pub fn current(&self) -> Option<ShownFrame> {
        self.current
    }

    /// Index of the asset whose frame is on screen
    pub fn showing_asset_index(&self) -> Option<usize> {
        self.current.map(|f| f.asset_index)
    }

    /// Releases the shown frame
    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            self.surface.release(previous.handle);
        }
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// One upload seen by a `RecordingSurface`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub handle: SurfaceHandle,
    pub pts: Option<i64>,
    pub rotation: i32,
    pub output_size: (u32, u32),
}

#[derive(Debug, Default)]
struct Recording {
    next_handle: u64,
    uploads: Vec<RecordedUpload>,
    live: Vec<SurfaceHandle>,
}

/// Headless surface that records uploads; clones share the recording
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.recording.lock().uploads.clone()
    }

    /// Handles uploaded and not yet released
    pub fn live_handles(&self) -> usize {
        self.recording.lock().live.len()
    }
}

impl FrameSurface for RecordingSurface {
    fn upload(&mut self, request: SurfaceRequest<'_>) -> Result<SurfaceHandle, SurfaceError> {
        let mut recording = self.recording.lock();
        recording.next_handle += 1;
        let handle = SurfaceHandle(recording.next_handle);
        recording.uploads.push(RecordedUpload {
            handle,
            pts: request.picture.timestamp(),
            rotation: request.rotation,
            output_size: request.output_size(),
        });
        recording.live.push(handle);
        Ok(handle)
    }

    fn release(&mut self, handle: SurfaceHandle) {
        self.recording.lock().live.retain(|h| *h != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::frame::{PixelFormat, Plane};
    use std::path::PathBuf;

    fn unit(width: u32, height: u32, timestamp: f64, asset_index: usize) -> DecodedFrameUnit {
        let picture = DecodedPicture {
            width,
            height,
            format: PixelFormat::Gray8,
            planes: vec![Plane { data: vec![0; (width * height) as usize], stride: width as usize }],
            pts: Some((timestamp * 90_000.0) as i64),
            best_effort_timestamp: None,
        };
        DecodedFrameUnit::new(picture, timestamp, PathBuf::from("a.mp4"), asset_index)
    }

    #[test]
    fn test_show_releases_previous() {
        let surface = RecordingSurface::new();
        let mut renderer = FrameRenderer::new(Box::new(surface.clone()), SurfaceConfig::default());

        renderer.show(&unit(320, 180, 0.0, 0), 0).unwrap();
        renderer.show(&unit(320, 180, 0.04, 1), 0).unwrap();
        assert_eq!(surface.uploads().len(), 2);
        assert_eq!(surface.live_handles(), 1);
        assert_eq!(renderer.showing_asset_index(), Some(1));

        drop(renderer);
        assert_eq!(surface.live_handles(), 0);
    }

    #[test]
    fn test_rotation_and_limits() {
        let surface = RecordingSurface::new();
        let mut renderer = FrameRenderer::new(Box::new(surface.clone()), SurfaceConfig::default());
        renderer.show(&unit(1920, 1080, 0.0, 0), 90).unwrap();

        let upload = &surface.uploads()[0];
        assert_eq!(upload.rotation, 90);
        assert_eq!(upload.output_size, (720, 1280));
    }

    #[test]
    fn test_rejects_end_marker() {
        let mut renderer = FrameRenderer::new(Box::new(RecordingSurface::new()), SurfaceConfig::default());
        let marker = DecodedFrameUnit::end_of_stream(PathBuf::from("a.mp4"), 0);
        assert!(matches!(renderer.show(&marker, 0), Err(SurfaceError::InvalidPicture(_))));
        assert!(renderer.current().is_none());
    }
}
