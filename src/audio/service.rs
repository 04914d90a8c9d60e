//! Audio decode service: one background thread mixing every audible asset
//! into the ring buffer the output callback drains.
//!
//! Media assets contribute their soundtrack on their timeline segment and act
//! as the origin track that advances the buffer position. Background audio
//! assets are mixed on top, optionally looping over their display range.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::audio::buffer::AudioRingBuffer;
use crate::audio::context::AudioDecodeContext;
use crate::audio::mixer::{mix_into, mix_scaled_into};
use crate::config::AudioDecodeConfig;
use crate::core::project::{is_audio_assets_changed, is_audio_volume_changed, Project, TimeRange};
use crate::core::time::{PTS_EPS, TIME_EPS};
use crate::core::timeline::Timeline;
use crate::media::{Filled, MediaBackend};
use crate::playback::sync::ReferenceClock;

struct State {
    project: Arc<Project>,
    assets_updated: bool,
    volume_updated: bool,
    pending_position: Option<f64>,
    stopped: bool,
    released: bool,
}

struct Shared {
    backend: Arc<dyn MediaBackend>,
    config: AudioDecodeConfig,
    ring: AudioRingBuffer,
    clock: Arc<ReferenceClock>,
    state: Mutex<State>,
    wake: Condvar,
}

/// Decodes and mixes the project's audio on a dedicated thread
pub struct AudioDecodeService {
    shared: Arc<Shared>,
    start_stop: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
    scratch: Mutex<Vec<i16>>,
}

impl AudioDecodeService {
    pub fn new(backend: Arc<dyn MediaBackend>, config: AudioDecodeConfig, clock: Arc<ReferenceClock>) -> Self {
        let ring = AudioRingBuffer::new(config.ring_capacity().max(1), config.format.channels, config.format.sample_rate);
        tracing::debug!(capacity = ring.capacity(), "audio decode service created");
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                ring,
                clock,
                state: Mutex::new(State {
                    project: Arc::new(Project::default()),
                    assets_updated: false,
                    volume_updated: false,
                    pending_position: None,
                    stopped: true,
                    released: false,
                }),
                wake: Condvar::new(),
            }),
            start_stop: Mutex::new(()),
            thread: Mutex::new(None),
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Swaps in `project`. Structural audio edits rebuild the decoders,
    /// volume edits are patched in place; `position` also moves decoding.
    pub fn set_project(&self, project: Arc<Project>, position: Option<f64>) {
        let mut state = self.shared.state.lock();
        if state.released {
            return;
        }
        let assets_updated = state.stopped || is_audio_assets_changed(&state.project, &project);
        if assets_updated {
            state.assets_updated = true;
        }
        if assets_updated || position.is_some() {
            self.shared.ring.clear();
        } else if is_audio_volume_changed(&state.project, &project) {
            state.volume_updated = true;
        }
        if let Some(pos) = position {
            let pos = pos.max(0.0);
            state.pending_position = Some(pos);
            self.shared.clock.set(pos);
        }
        state.project = project;
        self.shared.wake.notify_all();
        tracing::debug!(assets_updated, position, "audio project set");
    }

    /// Drops buffered audio and restarts mixing at `render_pos`
    pub fn reset_decode_position(&self, render_pos: f64) {
        let mut state = self.shared.state.lock();
        if state.released {
            return;
        }
        let pos = render_pos.max(0.0);
        state.pending_position = Some(pos);
        self.shared.clock.set(pos);
        self.shared.ring.clear();
        self.shared.wake.notify_all();
        tracing::debug!(render_pos = pos, "audio decode position reset");
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
            // A fresh thread owns no decoders yet
            state.assets_updated = true;
        }
        self.shared.ring.reopen();

        let worker = MixWorker::new(Arc::clone(&self.shared));
        match thread::Builder::new()
            .name("audio-decode".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                tracing::info!("audio decode started");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn audio decode thread");
                self.shared.state.lock().stopped = true;
            }
        }
    }

    /// Stops and joins the decode thread. Must not be called from it.
    pub fn stop(&self) {
        let _start_stop = self.start_stop.lock();
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.ring.release();
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("audio decode thread panicked");
            }
            tracing::info!("audio decode stopped");
        }
    }

    pub fn stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Output callback entry point: adds up to `dst.len()` buffered samples
    /// into `dst` without blocking and advances the reference clock.
    pub fn fill_buffer(&self, dst: &mut [i16]) -> Filled {
        let mut scratch = self.scratch.lock();
        scratch.resize(dst.len(), 0);
        let (samples, position) = self.shared.ring.get(&mut scratch[..], false);
        if samples == 0 {
            return Filled::empty();
        }
        mix_into(&mut dst[..samples], &scratch[..samples]);
        if let Some(pos) = position {
            self.shared.clock.set(pos);
        }
        Filled { samples, position }
    }

    /// Samples (all channels) waiting in the ring buffer
    pub fn buffered_samples(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn buffered_ms(&self) -> u64 {
        let per_second = self.shared.config.format.samples_per_second().max(1);
        (self.buffered_samples() * 1000 / per_second) as u64
    }

    pub fn clock(&self) -> &Arc<ReferenceClock> {
        &self.shared.clock
    }
}

impl Drop for AudioDecodeService {
    fn drop(&mut self) {
        self.shared.state.lock().released = true;
        self.stop();
    }
}

/// One audible asset and its decoder
struct AssetAudioDecoder {
    asset_id: u64,
    asset_path: PathBuf,
    volume: f32,
    repeat: bool,
    loop_count: u64,
    display_range: TimeRange,  // Project seconds
    clipped_range: TimeRange,  // Asset-local seconds
    context: AudioDecodeContext,
}

impl AssetAudioDecoder {
    fn matches(&self, asset_id: u64, asset_path: &std::path::Path) -> bool {
        self.asset_id == asset_id && self.asset_path == asset_path
    }

    /// Asset-local offset and loop index for project position `pos`
    fn local_position(&self, pos: f64) -> (f64, u64) {
        let local = (pos - self.display_range.start).max(0.0);
        let duration = self.clipped_range.duration;
        if self.repeat && duration > TIME_EPS {
            wrap_loop(local, duration)
        } else {
            (local, 0)
        }
    }
}

/// Splits `local` into loop index and offset within one `duration`. A
/// position within `TIME_EPS` of a loop end already belongs to the next loop.
fn wrap_loop(local: f64, duration: f64) -> (f64, u64) {
    let loops = ((local + TIME_EPS) / duration).floor().max(0.0);
    ((local - loops * duration).max(0.0), loops as u64)
}

/// Asset description used while rebuilding decoders
struct AudibleAsset {
    asset_id: u64,
    asset_path: PathBuf,
    volume: f32,
    repeat: bool,
    display_range: TimeRange,
    clipped_range: TimeRange,
}

/// Media-asset soundtracks along their segments, then background audio
fn audible_assets(project: &Project) -> Vec<AudibleAsset> {
    let timeline = Timeline::new(project);
    let media = timeline.segments().iter().filter(|s| !s.is_empty()).filter_map(|segment| {
        let asset = project.media_assets.get(segment.asset_index)?;
        Some(AudibleAsset {
            asset_id: asset.asset_id,
            asset_path: asset.asset_path.clone(),
            volume: asset.volume,
            repeat: false,
            display_range: TimeRange::new(segment.start, segment.duration()),
            clipped_range: asset.clipped_range(),
        })
    });
    let background = project.audio_assets.iter().map(|asset| AudibleAsset {
        asset_id: asset.asset_id,
        asset_path: asset.asset_path.clone(),
        volume: asset.volume,
        repeat: asset.repeat,
        display_range: asset.display_range,
        clipped_range: asset.clipped_range(),
    });
    media.chain(background).collect()
}

/// State owned by the decode thread
struct MixWorker {
    shared: Arc<Shared>,
    project: Arc<Project>,
    decoders: Vec<AssetAudioDecoder>,
    buffer_pos: f64,
    generation: u64,  // Ring generation the queued chunks belong to
    chunk: Vec<i16>,
    scratch: Vec<i16>,
}

impl MixWorker {
    fn new(shared: Arc<Shared>) -> Self {
        let project = Arc::clone(&shared.state.lock().project);
        let quantum = shared.config.quantum_samples().max(1);
        Self {
            shared,
            project,
            decoders: Vec::new(),
            buffer_pos: 0.0,
            generation: 0,
            chunk: vec![0; quantum],
            scratch: vec![0; quantum],
        }
    }

    fn run(mut self) {
        tracing::debug!("audio decode thread running");
        loop {
            let (assets_updated, volume_updated, position) = {
                let mut state = self.shared.state.lock();
                while !state.stopped && state.project.media_assets.is_empty() {
                    self.shared.wake.wait(&mut state);
                }
                if state.stopped {
                    break;
                }
                let assets_updated = std::mem::take(&mut state.assets_updated);
                let volume_updated = std::mem::take(&mut state.volume_updated);
                let mut position = state.pending_position.take();
                self.project = Arc::clone(&state.project);
                if assets_updated && position.is_none() {
                    self.shared.ring.clear();
                    position = Some(self.shared.clock.render_pos());
                }
                (assets_updated, volume_updated, position)
            };

            if assets_updated {
                self.rebuild_decoders();
            } else if volume_updated {
                self.update_volumes();
            }
            if let Some(pos) = position {
                self.seek_decoders(pos);
                self.buffer_pos = pos;
                self.shared.clock.set(pos);
                self.generation = self.shared.ring.clear();
            }
            self.buffer_one_quantum();
        }
        tracing::debug!("audio decode thread exiting");
    }

    fn rebuild_decoders(&mut self) {
        let mut previous = std::mem::take(&mut self.decoders);
        for asset in audible_assets(&self.project) {
            let reused = previous
                .iter()
                .position(|d| d.matches(asset.asset_id, &asset.asset_path))
                .map(|i| previous.swap_remove(i).context);
            let mut context = match reused {
                Some(context) => context,
                None => {
                    let mut context = AudioDecodeContext::new(Arc::clone(&self.shared.backend), self.shared.config.clone());
                    if let Err(e) = context.open(&asset.asset_path) {
                        tracing::debug!(path = %asset.asset_path.display(), error = %e, "asset has no playable audio");
                        continue;
                    }
                    context
                }
            };
            if context.duration() < TIME_EPS {
                continue;
            }
            context.set_clipped_start(asset.clipped_range.start);
            self.decoders.push(AssetAudioDecoder {
                asset_id: asset.asset_id,
                asset_path: asset.asset_path,
                volume: asset.volume,
                repeat: asset.repeat,
                loop_count: 0,
                display_range: asset.display_range,
                clipped_range: asset.clipped_range,
                context,
            });
        }
        tracing::info!(decoders = self.decoders.len(), "audio decoders rebuilt");
    }

    fn update_volumes(&mut self) {
        let project = &self.project;
        for decoder in &mut self.decoders {
            let volume = project
                .media_assets
                .iter()
                .find(|a| decoder.matches(a.asset_id, &a.asset_path))
                .map(|a| a.volume)
                .or_else(|| {
                    project
                        .audio_assets
                        .iter()
                        .find(|a| decoder.matches(a.asset_id, &a.asset_path))
                        .map(|a| a.volume)
                });
            if let Some(volume) = volume {
                decoder.volume = volume;
            }
        }
        tracing::debug!("audio volumes updated");
    }

    fn seek_decoders(&mut self, pos: f64) {
        for decoder in &mut self.decoders {
            let (local, loops) = decoder.local_position(pos);
            decoder.loop_count = loops;
            let target = decoder.clipped_range.start + local.min(decoder.clipped_range.duration);
            if let Err(e) = decoder.context.seek(target) {
                tracing::warn!(path = %decoder.asset_path.display(), target, error = %e, "audio seek failed");
            }
        }
    }

    /// Mixes one quantum at `buffer_pos` and queues it
    fn buffer_one_quantum(&mut self) {
        let rate = self.shared.config.format.sample_rate as f64;
        let channels = self.shared.config.format.channels.max(1) as usize;
        let pos = self.buffer_pos;
        let quantum_duration = (self.chunk.len() / channels) as f64 / rate;

        self.chunk.fill(0);
        let mut origin = None;
        for decoder in &mut self.decoders {
            let display = decoder.display_range;
            let clipped = decoder.clipped_range;
            if pos >= display.end() - PTS_EPS || pos < display.start - PTS_EPS {
                continue;
            }
            if clipped.duration < TIME_EPS {
                continue;
            }
            if !decoder.repeat && pos >= display.start + clipped.duration {
                continue;
            }

            let (local, loops) = decoder.local_position(pos);
            let mut sample_pos = ((pos - display.start).max(0.0) * rate).round() as i64;
            if decoder.repeat {
                if loops != decoder.loop_count {
                    decoder.loop_count = loops;
                    if let Err(e) = decoder.context.seek(clipped.start + local) {
                        tracing::warn!(path = %decoder.asset_path.display(), error = %e, "audio loop seek failed");
                    }
                }
                let clipped_len = ((clipped.duration * rate).round() as i64).max(1);
                sample_pos %= clipped_len;
            }

            self.scratch.fill(0);
            let target = sample_pos + (clipped.start * rate).round() as i64;
            if !decoder.context.get_audio(target, &mut self.scratch) {
                continue;
            }
            if origin.is_none() && !decoder.repeat {
                origin = Some(decoder.context.current_buffer_sec() + display.start - clipped.start);
            }
            mix_scaled_into(&mut self.chunk, &self.scratch, decoder.volume);
        }

        let next = origin.unwrap_or(pos + quantum_duration);
        self.buffer_pos = self.buffer_pos.max(next).max(0.0);

        // Dropped when the ring was cleared for a newer position meanwhile
        let put_pos = pos.max(self.shared.clock.render_pos());
        self.shared.ring.put_in_generation(&self.chunk, put_pos, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::project::{AudioAsset, MediaAsset};
    use crate::media::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticVideo, Waveform};
    use std::time::{Duration, Instant};

    struct Fixture {
        service: AudioDecodeService,
        backend: Arc<SyntheticBackend>,
        clock: Arc<ReferenceClock>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(SyntheticBackend::new());
        let clock = Arc::new(ReferenceClock::new());
        let service = AudioDecodeService::new(backend.clone(), AudioDecodeConfig::default(), Arc::clone(&clock));
        Fixture { service, backend, clock }
    }

    fn clip(backend: &SyntheticBackend, path: &str, duration: f64, audio: Option<SyntheticAudio>) -> MediaAsset {
        backend.add_video(path, SyntheticVideo::new(duration, 30));
        if let Some(audio) = audio {
            backend.add_audio(path, audio);
        }
        MediaAsset::new(path.len() as u64, path)
    }

    fn wait_buffered(service: &AudioDecodeService, samples: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if service.buffered_samples() >= samples {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_wrap_loop() {
        let (local, loops) = wrap_loop(0.5, 2.0);
        assert_eq!(loops, 0);
        assert!((local - 0.5).abs() < 1e-9);

        let (local, loops) = wrap_loop(5.0, 2.0);
        assert_eq!(loops, 2);
        assert!((local - 1.0).abs() < 1e-9);

        // Just short of a loop end counts as the next loop
        let (local, loops) = wrap_loop(4.0 - TIME_EPS / 2.0, 2.0);
        assert_eq!(loops, 2);
        assert!(local.abs() < 1e-9);

        // Hours into a short loop
        let (local, loops) = wrap_loop(3_600.25, 0.5);
        assert_eq!(loops, 7_200);
        assert!((local - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_buffers_from_requested_position() {
        let f = fixture();
        let asset = clip(&f.backend, "a.mp4", 2.0, Some(SyntheticAudio::new(2.0)));
        let mut project = Project::with_media_assets(vec![asset]);
        project.load(f.backend.as_ref());

        f.service.set_project(Arc::new(project), Some(0.5));
        f.service.start();
        assert!(wait_buffered(&f.service, 2048));

        let mut dst = vec![0i16; 2048];
        let filled = f.service.fill_buffer(&mut dst);
        assert_eq!(filled.samples, 2048);
        assert!((filled.position.unwrap() - 0.5).abs() < 1e-6);
        assert!(dst.iter().all(|s| *s == 1_000));
        assert!((f.clock.render_pos() - 0.5).abs() < 1e-6);
        f.service.stop();
    }

    #[test]
    fn test_overlapping_tracks_saturate() {
        let f = fixture();
        let loud = SyntheticAudio::new(2.0).with_waveform(Waveform::Constant(i16::MAX));
        let asset = clip(&f.backend, "a.mp4", 2.0, Some(loud.clone()));
        f.backend.add_audio("bgm.mp3", loud);
        let mut project = Project::with_media_assets(vec![asset]);
        project.audio_assets.push(AudioAsset::new(9, "bgm.mp3", TimeRange::new(0.0, 2.0)));
        project.load(f.backend.as_ref());

        f.service.set_project(Arc::new(project), Some(0.0));
        f.service.start();
        assert!(wait_buffered(&f.service, 2048));

        let mut dst = vec![0i16; 2048];
        f.service.fill_buffer(&mut dst);
        assert!(dst.iter().all(|s| *s == i16::MAX));
        f.service.stop();
    }

    #[test]
    fn test_volume_scales_and_updates_in_place() {
        let f = fixture();
        let asset = clip(&f.backend, "a.mp4", 3.0, Some(SyntheticAudio::new(3.0))).with_volume(0.5);
        let mut project = Project::with_media_assets(vec![asset]);
        project.load(f.backend.as_ref());
        let project = Arc::new(project);

        f.service.set_project(Arc::clone(&project), Some(0.0));
        f.service.start();
        assert!(wait_buffered(&f.service, 882));
        let mut dst = vec![0i16; 882];
        f.service.fill_buffer(&mut dst);
        assert!(dst.iter().all(|s| *s == 500));

        let mut louder = (*project).clone();
        louder.media_assets[0].volume = 1.0;
        f.service.set_project(Arc::new(louder), None);
        // Chunks mixed before the update drain first
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_full = false;
        while Instant::now() < deadline && !saw_full {
            let mut dst = vec![0i16; 882];
            if f.service.fill_buffer(&mut dst).samples > 0 {
                saw_full = dst[0] == 1_000;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(saw_full);
        // Volume edits keep the open decoders
        assert_eq!(f.backend.stats().audio_opens(), 1);
        f.service.stop();
    }

    #[test]
    fn test_video_only_project_buffers_silence_with_positions() {
        let f = fixture();
        let asset = clip(&f.backend, "mute.mp4", 2.0, None);
        let mut project = Project::with_media_assets(vec![asset]);
        project.load(f.backend.as_ref());

        f.service.set_project(Arc::new(project), Some(1.0));
        f.service.start();
        assert!(wait_buffered(&f.service, 882 * 2));

        let mut dst = vec![0i16; 882];
        let first = f.service.fill_buffer(&mut dst);
        let second = f.service.fill_buffer(&mut dst);
        assert!(dst.iter().all(|s| *s == 0));
        assert!((first.position.unwrap() - 1.0).abs() < 1e-6);
        assert!((second.position.unwrap() - 1.01).abs() < 1e-6);
        f.service.stop();
    }

    #[test]
    fn test_repeating_background_wraps() {
        let f = fixture();
        let asset = clip(&f.backend, "mute.mp4", 2.0, None);
        f.backend.add_audio("loop.wav", SyntheticAudio::new(0.5).with_channels(1).with_waveform(Waveform::Ramp));
        let mut project = Project::with_media_assets(vec![asset]);
        let mut bgm = AudioAsset::new(7, "loop.wav", TimeRange::new(0.0, 2.0));
        bgm.repeat = true;
        project.audio_assets.push(bgm);
        project.load(f.backend.as_ref());

        // 0.75 s is 0.25 s into the second loop
        f.service.set_project(Arc::new(project), Some(0.75));
        f.service.start();
        assert!(wait_buffered(&f.service, 882));

        let mut dst = vec![0i16; 2];
        let filled = f.service.fill_buffer(&mut dst);
        assert!((filled.position.unwrap() - 0.75).abs() < 1e-6);
        assert!((11_025..=12_288).contains(&(dst[0] as i64)), "got {}", dst[0]);
        f.service.stop();
    }

    #[test]
    fn test_reset_position_drops_buffered_audio() {
        let f = fixture();
        let asset = clip(&f.backend, "a.mp4", 4.0, Some(SyntheticAudio::new(4.0)));
        let mut project = Project::with_media_assets(vec![asset]);
        project.load(f.backend.as_ref());

        f.service.set_project(Arc::new(project), Some(0.0));
        f.service.start();
        assert!(wait_buffered(&f.service, 882));

        f.service.reset_decode_position(3.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut position = None;
        while Instant::now() < deadline && position.is_none() {
            let mut dst = vec![0i16; 882];
            position = f.service.fill_buffer(&mut dst).position;
            if position.is_none() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        let position = position.expect("audio after reset");
        assert!(position >= 3.0 - 1e-6, "stale audio at {position}");
        f.service.stop();
    }

    #[test]
    fn test_stop_with_full_ring_and_pending_seek() {
        let f = fixture();
        let asset = clip(&f.backend, "a.mp4", 10.0, Some(SyntheticAudio::new(10.0)));
        let mut project = Project::with_media_assets(vec![asset]);
        project.load(f.backend.as_ref());

        f.service.set_project(Arc::new(project), Some(0.0));
        f.service.start();
        // Nothing drains: the decode thread ends up blocked on a full ring
        assert!(wait_buffered(&f.service, AudioDecodeConfig::default().ring_capacity() - 882));
        f.service.reset_decode_position(5.0);
        f.service.stop();
        assert!(f.service.stopped());
    }
}
