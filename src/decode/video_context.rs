//! Per-file video decoding state: demuxer/decoder pair, GOP index, drain mode
//! and the seek decision.
//!
//! A context is owned by the video decode thread and reused across assets;
//! `open` on the file that is already open only resets drain mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::time::{rescale, seconds_to_ticks, ticks_to_seconds};
use crate::decode::frame::DecodedPicture;
use crate::decode::stream_info::{IndexEntry, VideoStreamInfo};
use crate::media::{DecodeError, MediaBackend, VideoDemuxer};

/// Still images have no GOP structure and are never sought within
const STILL_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Keyframe positions of a stream and the number of frames in each GOP
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GopIndex {
    keyframe_dts: Vec<i64>,
    gop_frame_count: Vec<u32>,
}

impl GopIndex {
    /// Builds the index from container entries. Discarded entries are
    /// ignored; frames before the first keyframe are not counted.
    pub fn from_entries(entries: &[IndexEntry]) -> Self {
        let mut index = Self::default();
        for entry in entries {
            if entry.keyframe {
                index.keyframe_dts.push(entry.timestamp);
                index.gop_frame_count.push(1);
            } else if !entry.discard {
                if let Some(count) = index.gop_frame_count.last_mut() {
                    *count += 1;
                }
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.keyframe_dts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keyframe_dts.len()
    }

    pub fn keyframe_dts(&self) -> &[i64] {
        &self.keyframe_dts
    }

    pub fn gop_frame_count(&self) -> &[u32] {
        &self.gop_frame_count
    }

    /// Index of the GOP containing `dts`, `None` before the first keyframe
    pub fn gop_of(&self, dts: i64) -> Option<usize> {
        self.keyframe_dts.partition_point(|kf| *kf <= dts).checked_sub(1)
    }
}

/// What `VideoDecodeContext::seek` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekAction {
    /// The demuxer was repositioned and the decoder flushed
    Repositioned,
    /// The target is ahead in the current GOP; decoding continues sequentially
    Sequential,
}

/// True for file names that decode as a single still image
pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| STILL_IMAGE_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Decoding state for the file currently being played
pub struct VideoDecodeContext {
    backend: Arc<dyn MediaBackend>,
    demuxer: Option<Box<dyn VideoDemuxer>>,
    path: Option<PathBuf>,
    gop: Option<GopIndex>,
    current_pts: Option<i64>,   // Last decoded pts in stream ticks
    draining: bool,
    no_seek_safe_frames: u32,
}

impl VideoDecodeContext {
    pub fn new(backend: Arc<dyn MediaBackend>, no_seek_safe_frames: u32) -> Self {
        Self {
            backend,
            demuxer: None,
            path: None,
            gop: None,
            current_pts: None,
            draining: false,
            no_seek_safe_frames,
        }
    }

    /// Opens `path` unless it is already open. Always leaves drain mode.
    pub fn open(&mut self, path: &Path) -> Result<(), DecodeError> {
        self.draining = false;
        if self.is_open() && self.path.as_deref() == Some(path) {
            tracing::debug!(path = %path.display(), "video file already open");
            return Ok(());
        }
        self.release();

        let demuxer = self.backend.open_video(path)?;
        let still = is_still_image(path);
        let gop = if still || demuxer.stream().duration <= 0 {
            None
        } else {
            Some(GopIndex::from_entries(&demuxer.index_entries())).filter(|g| !g.is_empty())
        };
        tracing::info!(
            path = %path.display(),
            still,
            gops = gop.as_ref().map_or(0, |g| g.len()),
            fps = demuxer.stream().fps(),
            "video file opened"
        );
        self.demuxer = Some(demuxer);
        self.gop = gop;
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Closes the file and forgets all per-file state
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::debug!(path = %path.display(), "video file released");
        }
        self.demuxer = None;
        self.gop = None;
        self.current_pts = None;
        self.draining = false;
    }

    pub fn is_open(&self) -> bool {
        self.demuxer.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn stream(&self) -> Option<&VideoStreamInfo> {
        self.demuxer.as_ref().map(|d| d.stream())
    }

    pub fn gop_index(&self) -> Option<&GopIndex> {
        self.gop.as_ref()
    }

    /// True once the demuxer hit end of file; stays set until `open`/`seek`
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Drops pictures buffered inside the decoder
    pub fn flush(&mut self) {
        if let Some(demuxer) = self.demuxer.as_mut() {
            demuxer.flush();
        }
    }

    /// Positions decoding so the next frames reach `asset_sec` (seconds in
    /// the file). Seeking is skipped when the target lies in the current GOP
    /// far enough ahead of the last decoded frame.
    pub fn seek(&mut self, asset_sec: f64) -> Result<SeekAction, DecodeError> {
        self.draining = false;
        let demuxer = self.demuxer.as_mut().ok_or(DecodeError::NotOpened)?;
        let stream = demuxer.stream().clone();
        let first_dts = stream.first_dts.unwrap_or(0);

        // Floor, never round: rounding up can skip the first frame after a backward seek
        let target_dts = seconds_to_ticks(asset_sec, stream.time_base) + first_dts;

        let sequential = match (&self.gop, self.current_pts) {
            (Some(gop), Some(current_pts)) => {
                let current_dts = current_pts + first_dts;
                let safe_window = if stream.avg_frame_rate.is_zero() {
                    0
                } else {
                    rescale(
                        self.no_seek_safe_frames as i64,
                        stream.avg_frame_rate.invert(),
                        stream.time_base,
                    )
                };
                gop.gop_of(target_dts) == gop.gop_of(current_dts) && target_dts >= current_dts + safe_window
            }
            _ => false,
        };

        if sequential {
            tracing::debug!(asset_sec, target_dts, "seek target ahead in current GOP, decoding through");
            return Ok(SeekAction::Sequential);
        }

        if let Err(e) = demuxer.seek(target_dts, true) {
            // Some MPEG-4 files only seek without the backward flag
            tracing::debug!(error = %e, target_dts, "backward seek failed, retrying unflagged");
            demuxer.seek(target_dts, false)?;
        }
        demuxer.flush();
        tracing::debug!(asset_sec, target_dts, "video seek");
        Ok(SeekAction::Repositioned)
    }

    /// Decodes the next picture of the video stream together with its
    /// position in seconds. Returns `Ok(None)` once the decoder is drained.
    ///
    /// At end of file the context switches to drain mode and keeps replaying
    /// the decoder's buffered pictures. Corrupt frames are skipped.
    pub fn read_one_frame(&mut self) -> Result<Option<(DecodedPicture, f64)>, DecodeError> {
        let demuxer = self.demuxer.as_mut().ok_or(DecodeError::NotOpened)?;
        let video_index = demuxer.stream().index;
        let time_base = demuxer.stream().time_base;

        loop {
            let decoded = if self.draining {
                demuxer.decode(None)
            } else {
                match demuxer.read_packet()? {
                    Some(packet) if packet.stream_index == video_index => demuxer.decode(Some(&packet)),
                    Some(_) => continue,
                    None => {
                        tracing::debug!("video demuxer reached end of file, draining decoder");
                        self.draining = true;
                        continue;
                    }
                }
            };

            match decoded {
                Ok(Some(mut picture)) => {
                    // Some recorders write packets without pts
                    let Some(ts) = picture.timestamp() else {
                        tracing::warn!("decoded picture without timestamp dropped");
                        continue;
                    };
                    picture.pts = Some(ts);
                    self.current_pts = Some(ts);
                    return Ok(Some((picture, ticks_to_seconds(ts, time_base))));
                }
                Ok(None) if self.draining => return Ok(None),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "dropping undecodable video frame");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for VideoDecodeContext {
    fn drop(&mut self) {
        self.release();
    }
}
