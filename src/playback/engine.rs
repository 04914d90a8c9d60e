//! Playback controller: owns both decode services, the audio output and the
//! frame renderer, and turns play/pause/seek/edit requests into service
//! commands.
//!
//! The render side calls `render_tick` once per display refresh. While
//! playing, the audio output is the master clock; otherwise the last render
//! position holds.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::service::AudioDecodeService;
use crate::config::{ConfigError, PlayerConfig};
use crate::core::project::{clear_file_info_if_asset_id_changed, is_timeline_changed, Project, ProjectError};
use crate::core::time::PTS_EPS;
use crate::decode::video_service::{FrameLookup, VideoDecodeService};
use crate::media::surface::{FrameRenderer, FrameSurface, ShownFrame, SurfaceError};
use crate::media::{AudioOutput, Filled, MediaBackend, OutputError};
use crate::playback::state::{BufferLevels, ReadyState, ReadyStateTracker};
use crate::playback::sync::{ClockMessageCenter, ReferenceClock};

/// Notifications for the embedding UI
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    ReadyStateChanged(ReadyState),
    /// The frame for the seek target is on screen
    SeekCompleted(f64),
    /// The last frame of the project was shown
    Ended,
}

/// Error type for the playback controller
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Audio output error: {0}")]
    Output(#[from] OutputError),
    #[error("Surface error: {0}")]
    Surface(#[from] SurfaceError),
    #[error("Project error: {0}")]
    Project(#[from] ProjectError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

struct ControlState {
    project: Arc<Project>,
    attached: bool,
    surface_size: (u32, u32),
    paused: bool,
    ended: bool,
    seeking: bool,
    seek_target: f64,
    current_time: f64,
    ready: ReadyStateTracker,
}

/// Drives preview playback of one project
pub struct PlaybackController {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    clock: Arc<ReferenceClock>,
    video: VideoDecodeService,
    audio: Arc<AudioDecodeService>,
    output: Arc<dyn AudioOutput>,
    renderer: Mutex<FrameRenderer>,
    state: Mutex<ControlState>,
    clock_messages: ClockMessageCenter,
    event_tx: Sender<PlayerEvent>,
    event_rx: Receiver<PlayerEvent>,
}

impl PlaybackController {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        output: Arc<dyn AudioOutput>,
        surface: Box<dyn FrameSurface>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        config.validate()?;
        let clock = Arc::new(ReferenceClock::new());
        let video = VideoDecodeService::new(Arc::clone(&backend), config.video.clone());
        let audio = Arc::new(AudioDecodeService::new(
            Arc::clone(&backend),
            config.audio.clone(),
            Arc::clone(&clock),
        ));

        let source = Arc::clone(&audio);
        output.set_data_callback(Box::new(move |buf: &mut [i16]| source.fill_buffer(buf)));

        let (event_tx, event_rx) = channel::unbounded();
        tracing::info!("playback controller created");
        Ok(Self {
            renderer: Mutex::new(FrameRenderer::new(surface, config.surface.clone())),
            state: Mutex::new(ControlState {
                project: Arc::new(Project::default()),
                attached: false,
                surface_size: (0, 0),
                paused: true,
                ended: false,
                seeking: false,
                seek_target: 0.0,
                current_time: 0.0,
                ready: ReadyStateTracker::new(config.ready.clone()),
            }),
            clock_messages: ClockMessageCenter::for_clock(Arc::clone(&clock)),
            config,
            backend,
            clock,
            video,
            audio,
            output,
            event_tx,
            event_rx,
        })
    }

    /// Receiver for player events; every clone sees a share of the events
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.event_rx.clone()
    }

    /// Loads `project`. A changed asset list restarts playback from zero;
    /// any other edit is applied in place.
    pub fn set_project(&self, mut project: Project) -> Result<(), PlaybackError> {
        let old = Arc::clone(&self.state.lock().project);
        clear_file_info_if_asset_id_changed(&mut project, &old);
        project.load(&*self.backend);
        let project = Arc::new(project);

        let mut state = self.state.lock();
        let timeline_changed = is_timeline_changed(&state.project, &project);
        state.project = Arc::clone(&project);
        if timeline_changed {
            state.current_time = 0.0;
            state.ended = false;
            state.seeking = false;
            self.video.set_project(Arc::clone(&project), 0.0);
            self.audio.set_project(Arc::clone(&project), Some(0.0));
            self.output.flush();
            self.renderer.lock().clear();
            let initial = if project.media_assets.is_empty() {
                ReadyState::NoData
            } else {
                ReadyState::MetaData
            };
            if state.ready.state() != initial {
                state.ready.reset(initial, Instant::now());
                self.emit(PlayerEvent::ReadyStateChanged(initial));
            }
        } else {
            self.video.update_project(Arc::clone(&project));
            self.audio.set_project(Arc::clone(&project), None);
        }
        tracing::info!(
            project_id = project.project_id,
            assets = project.media_assets.len(),
            duration = project.duration(),
            timeline_changed,
            "project set"
        );
        if state.attached {
            self.resume_decode(&state);
        }
        Ok(())
    }

    /// Binds to a display surface of the given size and starts decoding
    pub fn attach(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.attached = true;
        state.surface_size = (width, height);
        tracing::info!(width, height, "surface attached");
        self.resume_decode(&state);
    }

    /// Stops decoding and releases the shown frame
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = false;
        if let Err(e) = self.output.pause() {
            tracing::warn!(error = %e, "failed to pause audio output on detach");
        }
        self.video.stop();
        self.audio.stop();
        self.renderer.lock().clear();
        tracing::info!("surface detached");
    }

    pub fn play(&self) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        if state.ended {
            state.ended = false;
            self.seek_locked(&mut state, 0.0);
        }
        state.paused = false;
        if state.ready.state().can_play() {
            self.output.play()?;
        }
        tracing::info!(position = state.current_time, "play");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        state.current_time = self.render_position(&state);
        state.paused = true;
        self.output.pause()?;
        tracing::info!(position = state.current_time, "pause");
        Ok(())
    }

    /// Moves playback to `position` (project seconds, clamped into the project)
    pub fn seek(&self, position: f64) {
        let mut state = self.state.lock();
        self.seek_locked(&mut state, position);
    }

    fn seek_locked(&self, state: &mut ControlState, position: f64) {
        let duration = state.project.duration();
        let target = position.min(duration).max(0.0);
        state.ended = false;
        state.seeking = true;
        state.seek_target = target;
        state.current_time = target;
        self.video.reset_decode_position(target);
        self.audio.reset_decode_position(target);
        self.output.flush();
        tracing::debug!(target, "seek");
    }

    /// Advances the presentation: computes the render position, shows the
    /// due frame, detects the end and updates the ready state.
    pub fn render_tick(&self) -> Result<Option<ShownFrame>, PlaybackError> {
        let mut state = self.state.lock();
        if !state.attached {
            return Ok(None);
        }
        let pos = self.render_position(&state);
        if !state.seeking {
            state.current_time = pos;
        }
        self.clock_messages.post(pos);

        let lookup = if self.config.video.latest_if_lagging {
            FrameLookup::LatestIfLagging
        } else {
            FrameLookup::Exact
        };
        let shown = match self.video.get_render_frame_at(pos, lookup) {
            Some(unit) => {
                let rotation = state
                    .project
                    .media_assets
                    .get(unit.asset_index)
                    .map_or(0, |a| a.rotation());
                Some(self.renderer.lock().show(&unit, rotation)?)
            }
            None => None,
        };

        let video_done = (self.video.ended() || self.video.failed()) && self.video.buffered_frame_count() <= 1;
        if state.seeking && (shown.is_some() || video_done) {
            state.seeking = false;
            tracing::debug!(target = state.seek_target, "seek completed");
            self.emit(PlayerEvent::SeekCompleted(state.seek_target));
        }
        if !state.ended && !state.seeking && video_done && self.reached_end(&state, pos) {
            state.ended = true;
            state.paused = true;
            if let Err(e) = self.output.pause() {
                tracing::warn!(error = %e, "failed to pause audio output at end");
            }
            tracing::info!(position = pos, "playback ended");
            self.emit(PlayerEvent::Ended);
        }

        self.update_ready_state(&mut state, video_done);
        Ok(shown)
    }

    pub fn current_time(&self) -> f64 {
        let state = self.state.lock();
        if state.seeking {
            state.seek_target
        } else {
            state.current_time
        }
    }

    pub fn duration(&self) -> f64 {
        self.state.lock().project.duration()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.lock().ready.state()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn is_seeking(&self) -> bool {
        self.state.lock().seeking
    }

    pub fn project(&self) -> Arc<Project> {
        Arc::clone(&self.state.lock().project)
    }

    /// Shared render clock, advanced by the audio output
    pub fn clock(&self) -> &Arc<ReferenceClock> {
        &self.clock
    }

    /// Audio position when the output is audible, else the held position
    fn render_position(&self, state: &ControlState) -> f64 {
        if state.seeking {
            return state.seek_target;
        }
        if !state.paused && self.output.is_playing() {
            if let Some(t) = self.output.current_time_sec() {
                return t;
            }
        }
        state.current_time
    }

    /// The last frame has had its full display time
    fn reached_end(&self, state: &ControlState, pos: f64) -> bool {
        if self.video.failed() {
            return true;
        }
        let frame_duration = 1.0 / state.project.fps();
        pos >= state.project.duration() - frame_duration - PTS_EPS
    }

    fn update_ready_state(&self, state: &mut ControlState, video_done: bool) {
        let levels = BufferLevels {
            has_project: !state.project.media_assets.is_empty(),
            video_frames: self.video.buffered_frame_count(),
            audio_ms: self.audio.buffered_ms(),
            video_ended: video_done,
        };
        let Some(ready) = state.ready.update(levels, Instant::now()) else {
            return;
        };
        self.emit(PlayerEvent::ReadyStateChanged(ready));
        if state.paused || state.ended {
            return;
        }
        let result = if ready.can_play() {
            self.output.play()
        } else {
            // Starved: hold audio until buffers refill
            self.output.pause()
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, ?ready, "audio output did not follow ready state");
        }
    }

    /// Restarts stopped decode services at the current position
    fn resume_decode(&self, state: &ControlState) {
        let position = if state.seeking { state.seek_target } else { state.current_time };
        if self.video.stopped() {
            self.video.set_project(Arc::clone(&state.project), position);
            self.video.start();
        }
        if self.audio.stopped() {
            self.audio.set_project(Arc::clone(&state.project), Some(position));
            self.audio.start();
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::trace!("player event dropped");
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.video.stop();
        self.audio.stop();
        // The callback holds the audio service; detach it before releasing
        self.output.set_data_callback(Box::new(|_buf: &mut [i16]| Filled::empty()));
        self.output.release();
        tracing::info!("playback controller released");
    }
}
