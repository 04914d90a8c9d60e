//! Video decode service: one background thread decoding the project's media
//! assets back to back into a bounded frame queue, and the pts-based frame
//! selection the render path pulls from.
//!
//! Locking: `pop_lock` is taken before `state`; the queue's internal lock is
//! always innermost. No lock is held while a file is opened or sought.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::VideoDecodeConfig;
use crate::core::project::Project;
use crate::core::queue::BoundedQueue;
use crate::core::time::{PTS_EPS, TIME_BASE_TICKS, ZERO_FRAME_TOLERANCE};
use crate::core::timeline::{Segment, Timeline};
use crate::decode::frame::DecodedFrameUnit;
use crate::decode::video_context::VideoDecodeContext;
use crate::media::{DecodeError, MediaBackend};

/// How `get_render_frame_at` treats frames that are already due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLookup {
    /// The newest frame not after the requested position
    #[default]
    Exact,
    /// The newest due frame even when later frames are not decoded yet, so a
    /// lagging renderer jumps ahead instead of waiting
    LatestIfLagging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Discard,
    Take,
    Stop,
}

fn select(first: i64, second: i64, pts: i64, lookup: FrameLookup) -> Selection {
    if lookup == FrameLookup::LatestIfLagging && first <= pts {
        return Selection::Take;
    }
    if second <= pts {
        Selection::Discard
    } else if first <= pts {
        Selection::Take
    } else {
        Selection::Stop
    }
}

/// Positions compared in microseconds so float noise cannot reorder frames
fn to_ticks(seconds: f64) -> i64 {
    if seconds.is_infinite() {
        return if seconds > 0.0 { i64::MAX } else { i64::MIN };
    }
    (seconds * TIME_BASE_TICKS as f64).round() as i64
}

struct State {
    project: Arc<Project>,
    project_changed: bool,
    pending_position: Option<f64>,
    stopped: bool,
    released: bool,
    ended: bool,
    failed: bool,
}

struct Shared {
    backend: Arc<dyn MediaBackend>,
    config: VideoDecodeConfig,
    queue: BoundedQueue<DecodedFrameUnit>,
    pop_lock: Mutex<()>,
    state: Mutex<State>,
    wake: Condvar,
}

/// Decodes the project's video track on a dedicated thread
pub struct VideoDecodeService {
    shared: Arc<Shared>,
    start_stop: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoDecodeService {
    pub fn new(backend: Arc<dyn MediaBackend>, config: VideoDecodeConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        tracing::debug!(capacity, "video decode service created");
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                queue: BoundedQueue::new(capacity),
                pop_lock: Mutex::new(()),
                state: Mutex::new(State {
                    project: Arc::new(Project::default()),
                    project_changed: false,
                    pending_position: None,
                    stopped: true,
                    released: false,
                    ended: false,
                    failed: false,
                }),
                wake: Condvar::new(),
            }),
            start_stop: Mutex::new(()),
            thread: Mutex::new(None),
        }
    }

    /// Replaces the project and restarts decoding at `render_pos`
    pub fn set_project(&self, project: Arc<Project>, render_pos: f64) {
        let _pop = self.shared.pop_lock.lock();
        let mut state = self.shared.state.lock();
        if state.released {
            return;
        }
        state.project = project;
        state.project_changed = true;
        state.ended = false;
        state.pending_position = Some(render_pos);
        self.shared.queue.clear();
        self.shared.wake.notify_all();
        tracing::info!(render_pos, "video project set");
    }

    /// Swaps in an edited project without moving the decode position
    pub fn update_project(&self, project: Arc<Project>) {
        {
            let mut state = self.shared.state.lock();
            if state.released {
                return;
            }
            state.project = project;
            state.project_changed = true;
        }
        self.shared.wake.notify_all();
        tracing::debug!("video project updated");
    }

    /// Moves decoding to `render_pos`. Frames decoded for earlier positions
    /// are evicted immediately and never returned.
    pub fn reset_decode_position(&self, render_pos: f64) {
        let _pop = self.shared.pop_lock.lock();
        let mut state = self.shared.state.lock();
        if state.released {
            return;
        }
        state.ended = false;
        state.pending_position = Some(render_pos);
        self.shared.queue.close();
        self.shared.wake.notify_all();
        tracing::debug!(render_pos, "video decode position reset");
    }

    /// Spawns the decode thread if it is not running
    pub fn start(&self) {
        let _start_stop = self.start_stop.lock();
        {
            let mut state = self.shared.state.lock();
            if !state.stopped || state.released {
                return;
            }
            state.stopped = false;
            state.failed = false;
        }
        self.shared.queue.open();

        let worker = DecodeWorker::new(Arc::clone(&self.shared));
        match thread::Builder::new()
            .name("video-decode".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                tracing::info!("video decode started");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn video decode thread");
                self.shared.state.lock().stopped = true;
            }
        }
    }

    /// Stops and joins the decode thread. Must not be called from it.
    pub fn stop(&self) {
        let _start_stop = self.start_stop.lock();
        {
            let _pop = self.shared.pop_lock.lock();
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.queue.close();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("video decode thread panicked");
            }
            tracing::info!("video decode stopped");
        }
    }

    /// Takes the frame to show at `pts` (project seconds), or `None` when no
    /// queued frame is due yet. Frames older than the returned one are
    /// discarded; a frame is never returned twice.
    pub fn get_render_frame_at(&self, pts: f64, lookup: FrameLookup) -> Option<DecodedFrameUnit> {
        let _pop = self.shared.pop_lock.lock();
        let state = self.shared.state.lock();
        if state.stopped {
            return None;
        }
        let queue = &self.shared.queue;

        if pts.abs() < PTS_EPS {
            let first = queue.pop_front_if(|units| {
                units
                    .front()
                    .is_some_and(|u| (u.timestamp - pts).abs() < ZERO_FRAME_TOLERANCE)
            });
            if first.is_some() {
                return first;
            }
        }

        let requested = to_ticks(pts);
        let mut selected = None;
        while queue.len() > 1 && !queue.is_closed() {
            let mut selection = Selection::Stop;
            let popped = queue.pop_front_if(|units| {
                let (Some(first), Some(second)) = (units.front(), units.get(1)) else {
                    return false;
                };
                selection = select(to_ticks(first.timestamp), to_ticks(second.timestamp), requested, lookup);
                selection != Selection::Stop
            });
            match selection {
                Selection::Discard => {}
                Selection::Take => selected = popped,
                Selection::Stop => return selected,
            }
        }

        if selected.is_none() && state.ended && !queue.is_empty() {
            selected = queue.pop_front_if(|units| {
                units
                    .front()
                    .is_some_and(|u| !u.is_end_of_stream() && to_ticks(u.timestamp) <= requested)
            });
        }
        selected
    }

    /// True once the last frame of the timeline has been queued
    pub fn ended(&self) -> bool {
        self.shared.state.lock().ended
    }

    pub fn stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// True when the decode thread gave up after an unrecoverable error
    pub fn failed(&self) -> bool {
        self.shared.state.lock().failed
    }

    /// Frames waiting in the queue, including the end-of-timeline marker
    pub fn buffered_frame_count(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for VideoDecodeService {
    fn drop(&mut self) {
        self.shared.state.lock().released = true;
        self.stop();
    }
}

/// State owned by the decode thread
struct DecodeWorker {
    shared: Arc<Shared>,
    project: Arc<Project>,
    timeline: Timeline,
    ctx: VideoDecodeContext,
    segment: Option<Segment>,
    first_frame_after_seek: bool,
    seek_target: f64,
    catch_up_to: f64,
}

impl DecodeWorker {
    fn new(shared: Arc<Shared>) -> Self {
        let project = Arc::clone(&shared.state.lock().project);
        let timeline = Timeline::new(&project);
        let ctx = VideoDecodeContext::new(Arc::clone(&shared.backend), shared.config.no_seek_safe_frames);
        Self {
            shared,
            project,
            timeline,
            ctx,
            segment: None,
            first_frame_after_seek: false,
            seek_target: 0.0,
            catch_up_to: f64::NEG_INFINITY,
        }
    }

    fn run(mut self) {
        if let Err(e) = self.decode_loop() {
            tracing::error!(error = %e, "video decode loop terminated");
            self.shared.state.lock().failed = true;
        }
        {
            let mut state = self.shared.state.lock();
            while !state.stopped {
                self.shared.wake.wait(&mut state);
            }
        }
        self.ctx.release();
        tracing::debug!("video decode thread exiting");
    }

    fn decode_loop(&mut self) -> Result<(), DecodeError> {
        loop {
            let (position, project_changed) = {
                let mut state = self.shared.state.lock();
                while state.project.media_assets.is_empty() && !state.stopped {
                    self.shared.wake.wait(&mut state);
                }
                if state.stopped {
                    return Ok(());
                }
                let project_changed = std::mem::take(&mut state.project_changed);
                if project_changed {
                    self.project = Arc::clone(&state.project);
                    self.timeline = Timeline::new(&self.project);
                    tracing::debug!(segments = self.timeline.segments().len(), "video timeline rebuilt");
                }
                let mut position = state.pending_position.take();
                if position.is_none() && self.segment.is_none() {
                    position = Some(0.0);
                }
                if position.is_some() {
                    state.ended = false;
                }
                (position, project_changed)
            };

            match position {
                Some(render_pos) => self.reposition(render_pos)?,
                None if project_changed => self.refresh_segment(),
                None => {}
            }

            let Some(segment) = self.segment else {
                self.wait_for_position();
                continue;
            };

            let frame = self.ctx.read_one_frame()?;
            if self.position_pending() {
                continue;
            }

            match frame {
                Some((picture, asset_sec)) => {
                    let mut timestamp = segment.to_project_position(asset_sec);
                    if timestamp <= self.catch_up_to - PTS_EPS {
                        tracing::trace!(timestamp, catch_up_to = self.catch_up_to, "frame before seek target dropped");
                    } else if timestamp < segment.start - PTS_EPS {
                        // Lead-in decoded from the keyframe before a trimmed clip start
                        tracing::trace!(timestamp, segment_start = segment.start, "frame before clip start dropped");
                    } else if timestamp >= segment.end - PTS_EPS {
                        tracing::debug!(timestamp, segment_end = segment.end, "frame past segment end");
                        self.ctx.flush();
                        self.finish_segment(segment)?;
                    } else {
                        if self.first_frame_after_seek && timestamp >= self.seek_target {
                            timestamp = self.seek_target;
                        }
                        let file = self.project.media_assets[segment.asset_index].asset_path.clone();
                        let unit = DecodedFrameUnit::new(picture, timestamp, file, segment.asset_index);
                        if self.shared.queue.push(unit) {
                            self.first_frame_after_seek = false;
                            tracing::trace!(timestamp, asset_index = segment.asset_index, "frame queued");
                        }
                    }
                }
                None => self.finish_segment(segment)?,
            }
        }
    }

    /// Opens the asset under `render_pos` and seeks to it
    fn reposition(&mut self, render_pos: f64) -> Result<(), DecodeError> {
        let Some(target) = self.timeline.segment_at(render_pos) else {
            self.segment = None;
            return Ok(());
        };
        let Some(segment) = self.open_playable(target)? else {
            self.segment = Some(target);
            self.reopen_queue();
            self.handle_end_of_timeline(target);
            return Ok(());
        };
        // Skipped ahead past assets that failed to open
        let render_pos = if segment.asset_index == target.asset_index {
            render_pos
        } else {
            segment.start
        };

        self.segment = Some(segment);
        self.first_frame_after_seek = true;
        self.seek_target = render_pos;
        self.catch_up_to = render_pos - 1.0 / self.frame_rate() - self.shared.config.max_last_frame_bias;

        let action = self.ctx.seek(segment.to_asset_position(render_pos))?;
        tracing::debug!(
            render_pos,
            asset_index = segment.asset_index,
            catch_up_to = self.catch_up_to,
            ?action,
            "video decode repositioned"
        );

        self.reopen_queue();
        Ok(())
    }

    /// Empties and reopens the queue unless another position is already pending
    fn reopen_queue(&self) {
        let _pop = self.shared.pop_lock.lock();
        let state = self.shared.state.lock();
        if !state.stopped && state.pending_position.is_none() {
            self.shared.queue.clear();
            self.shared.queue.open();
        }
    }

    /// Re-resolves the current segment's bounds after a trim edit
    fn refresh_segment(&mut self) {
        if let Some(current) = self.segment {
            self.segment = self.timeline.segment_for_asset(current.asset_index);
        }
    }

    /// Continues with the next segment, or marks the end of the timeline
    fn finish_segment(&mut self, segment: Segment) -> Result<(), DecodeError> {
        let next = match self.timeline.next_segment(&segment) {
            Some(next) => self.open_playable(next)?,
            None => None,
        };
        match next {
            Some(next) => {
                self.segment = Some(next);
                self.first_frame_after_seek = true;
                self.seek_target = next.start;
                self.catch_up_to = next.start;
                self.ctx.seek(next.clip_start)?;
                tracing::debug!(asset_index = next.asset_index, start = next.start, "continuing with next asset");
            }
            None => self.handle_end_of_timeline(segment),
        }
        Ok(())
    }

    /// Opens the asset of `segment`, skipping forward over assets that
    /// cannot be opened. `None` when nothing playable remains.
    fn open_playable(&mut self, mut segment: Segment) -> Result<Option<Segment>, DecodeError> {
        loop {
            let Some(asset) = self.project.media_assets.get(segment.asset_index) else {
                return Ok(None);
            };
            match self.ctx.open(&asset.asset_path) {
                Ok(()) => return Ok(Some(segment)),
                Err(
                    e @ (DecodeError::Open { .. } | DecodeError::StreamNotFound(_) | DecodeError::CodecNotFound(_)),
                ) => {
                    tracing::warn!(path = %asset.asset_path.display(), error = %e, "skipping asset that failed to open");
                    match self.timeline.next_segment(&segment) {
                        Some(next) => segment = next,
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Queues the end marker and parks until a new position or stop
    fn handle_end_of_timeline(&mut self, segment: Segment) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.ended = true;
            state.pending_position.is_some()
        };
        if !pending {
            let file = self
                .project
                .media_assets
                .get(segment.asset_index)
                .map(|a| a.asset_path.clone())
                .unwrap_or_default();
            self.shared.queue.push(DecodedFrameUnit::end_of_stream(file, segment.asset_index));
            tracing::info!("video decode reached end of timeline");
        }
        self.wait_for_position();
    }

    fn wait_for_position(&self) {
        let mut state = self.shared.state.lock();
        while state.pending_position.is_none() && !state.stopped {
            self.shared.wake.wait(&mut state);
        }
    }

    fn position_pending(&self) -> bool {
        self.shared.state.lock().pending_position.is_some()
    }

    /// Frame rate used for the catch-up bound
    fn frame_rate(&self) -> f64 {
        let project_fps = self.project.fps();
        match self.ctx.stream().map(|s| s.fps()) {
            Some(fps) if fps > 0.0 => fps.min(project_fps),
            _ => project_fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::{SyntheticBackend, SyntheticVideo};
    use crate::core::project::{MediaAsset, TimeRange};
    use std::time::{Duration, Instant};

    fn service_with(assets: &[(&str, SyntheticVideo)]) -> (VideoDecodeService, Arc<SyntheticBackend>, Arc<Project>) {
        let backend = Arc::new(SyntheticBackend::new());
        let mut media = Vec::new();
        for (i, (path, video)) in assets.iter().enumerate() {
            backend.add_video(*path, video.clone());
            media.push(MediaAsset::new(i as u64 + 1, *path));
        }
        let mut project = Project::with_media_assets(media);
        project.load(backend.as_ref());
        let service = VideoDecodeService::new(backend.clone(), VideoDecodeConfig::default());
        (service, backend, Arc::new(project))
    }

    fn wait_frame(service: &VideoDecodeService, pts: f64) -> Option<DecodedFrameUnit> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(unit) = service.get_render_frame_at(pts, FrameLookup::Exact) {
                return Some(unit);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_select() {
        assert_eq!(select(10, 20, 25, FrameLookup::Exact), Selection::Discard);
        assert_eq!(select(10, 20, 15, FrameLookup::Exact), Selection::Take);
        assert_eq!(select(10, 20, 5, FrameLookup::Exact), Selection::Stop);
        assert_eq!(select(10, 20, 25, FrameLookup::LatestIfLagging), Selection::Take);
        assert_eq!(select(10, 20, 5, FrameLookup::LatestIfLagging), Selection::Stop);
    }

    #[test]
    fn test_first_frame_at_zero() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(10.0, 30))]);
        service.set_project(project, 0.0);
        service.start();

        let unit = wait_frame(&service, 0.0).expect("first frame");
        assert!(unit.timestamp >= 0.0 && unit.timestamp < 0.005);
        service.stop();
    }

    #[test]
    fn test_sequential_queries_never_repeat_or_run_ahead() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(2.0, 30))]);
        service.set_project(project, 0.0);
        service.start();

        let mut last = f64::NEG_INFINITY;
        for k in 0..60 {
            let t = k as f64 / 30.0;
            let unit = wait_frame(&service, t).expect("frame");
            assert!(unit.timestamp <= t + 1e-9, "frame {} returned for {}", unit.timestamp, t);
            assert!(unit.timestamp > last, "frame {} returned twice", unit.timestamp);
            last = unit.timestamp;
        }
        service.stop();
    }

    #[test]
    fn test_end_of_timeline() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(1.0, 30))]);
        service.set_project(project, 0.0);
        service.start();

        let last = wait_frame(&service, 29.0 / 30.0).expect("last frame");
        assert!(last.timestamp < 1.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !service.ended() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(service.ended());
        // Nothing beyond the asset, and the end marker is never handed out
        assert!(service.get_render_frame_at(0.9999, FrameLookup::Exact).is_none());
        assert!(service.get_render_frame_at(5.0, FrameLookup::Exact).is_none());
        service.stop();
    }

    #[test]
    fn test_seek_into_second_asset() {
        let (service, backend, project) = service_with(&[
            ("a.mp4", SyntheticVideo::new(5.0, 30)),
            ("b.mp4", SyntheticVideo::new(3.0, 30)),
        ]);
        service.set_project(project, 0.0);
        service.start();
        wait_frame(&service, 0.0).expect("first frame");

        service.reset_decode_position(6.0);
        let unit = wait_frame(&service, 6.0).expect("frame after seek");
        assert_eq!(unit.asset_index, 1);
        assert!((unit.timestamp - 6.0).abs() < 1e-6);
        assert!(backend.stats().opened_video_paths().iter().any(|p| p.ends_with("b.mp4")));
        service.stop();
    }

    #[test]
    fn test_crosses_into_next_asset() {
        let (service, _, project) = service_with(&[
            ("a.mp4", SyntheticVideo::new(1.0, 10)),
            ("b.mp4", SyntheticVideo::new(1.0, 10)),
        ]);
        service.set_project(project, 0.0);
        service.start();

        let mut assets = Vec::new();
        for k in 0..20 {
            let unit = wait_frame(&service, k as f64 / 10.0).expect("frame");
            assets.push(unit.asset_index);
        }
        assert_eq!(&assets[..10], &[0; 10]);
        assert_eq!(&assets[10..], &[1; 10]);
        service.stop();
    }

    #[test]
    fn test_trimmed_asset_stops_at_segment_end() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.add_video("a.mp4", SyntheticVideo::new(4.0, 10));
        backend.add_video("b.mp4", SyntheticVideo::new(2.0, 10));
        let mut project = Project::with_media_assets(vec![
            MediaAsset::new(1, "a.mp4").with_clip_range(TimeRange::new(1.0, 1.0)),
            MediaAsset::new(2, "b.mp4"),
        ]);
        project.load(backend.as_ref());
        let service = VideoDecodeService::new(backend, VideoDecodeConfig::default());
        service.set_project(Arc::new(project), 0.0);
        service.start();

        for k in 0..15 {
            let t = k as f64 / 10.0;
            let unit = wait_frame(&service, t).expect("frame");
            let expected_asset = if k < 10 { 0 } else { 1 };
            assert_eq!(unit.asset_index, expected_asset, "at {t}");
            assert!((unit.timestamp - t).abs() < 1e-6);
        }
        service.stop();
    }

    #[test]
    fn test_next_asset_trimmed_mid_gop_hides_lead_in() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.add_video("a.mp4", SyntheticVideo::new(1.0, 10));
        backend.add_video("b.mp4", SyntheticVideo::new(4.0, 10).with_gop_size(30));
        let mut project = Project::with_media_assets(vec![
            MediaAsset::new(1, "a.mp4"),
            MediaAsset::new(2, "b.mp4").with_clip_range(TimeRange::new(1.5, 1.0)),
        ]);
        project.load(backend.as_ref());
        let service = VideoDecodeService::new(backend, VideoDecodeConfig::default());
        service.set_project(Arc::new(project), 0.0);
        service.start();

        // Frames of b before 1.5 s decode from the keyframe at 0 and must not surface
        for k in 0..20 {
            let t = k as f64 / 10.0 + 0.05;
            let unit = wait_frame(&service, t).expect("frame");
            let expected_asset = if k < 10 { 0 } else { 1 };
            assert_eq!(unit.asset_index, expected_asset, "at {t}");
            assert!((unit.timestamp - k as f64 / 10.0).abs() < 1e-6, "at {t} got {}", unit.timestamp);
        }
        service.stop();
    }

    #[test]
    fn test_rapid_seeks_honor_only_the_last() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(10.0, 30))]);
        service.set_project(project, 0.0);
        service.start();

        service.reset_decode_position(2.0);
        service.reset_decode_position(7.0);
        service.reset_decode_position(4.0);

        for k in 0..10 {
            let t = 4.0 + k as f64 / 30.0;
            let unit = wait_frame(&service, t).expect("frame");
            assert!(unit.timestamp <= t + 1e-9);
            assert!(unit.timestamp > 4.0 - 1.0 / 30.0 - 0.1, "stale frame {}", unit.timestamp);
        }
        service.stop();
    }

    #[test]
    fn test_stop_during_seek_does_not_deadlock() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(10.0, 30))]);
        let service = Arc::new(service);
        service.set_project(project, 0.0);
        service.start();

        let seeker = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for i in 0..200 {
                    service.reset_decode_position((i % 90) as f64 / 10.0);
                }
            })
        };
        thread::sleep(Duration::from_millis(5));
        service.stop();
        seeker.join().unwrap();
        assert!(service.stopped());
    }

    #[test]
    fn test_seek_failure_parks_thread() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(10.0, 30).with_failing_seeks())]);
        service.set_project(project, 0.0);
        service.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !service.failed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(service.failed());
        service.stop();
    }

    #[test]
    fn test_latest_if_lagging_jumps_ahead() {
        let (service, _, project) = service_with(&[("a.mp4", SyntheticVideo::new(2.0, 10))]);
        service.set_project(project, 0.0);
        service.start();
        wait_frame(&service, 0.0).expect("first frame");

        // Let the queue fill, then ask far ahead
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.buffered_frame_count() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        // Exact lookup needs the frame after 1.0 before it can answer
        let unit = service.get_render_frame_at(1.0, FrameLookup::LatestIfLagging).unwrap();
        assert!(unit.timestamp >= 0.4 - 1e-6 && unit.timestamp <= 1.0, "got {}", unit.timestamp);
        if let Some(next) = service.get_render_frame_at(1.0, FrameLookup::LatestIfLagging) {
            assert!(next.timestamp > unit.timestamp);
        }
        service.stop();
    }
}
