//! Ready-state machine.
//!
//! Mirrors the media-element ready states: how much of the project is
//! buffered ahead of the render position. Upgrades apply at once; a
//! downgrade waits until the current state has been held for the configured
//! dwell, so a single slow frame does not flicker the state.

use std::time::Instant;

use crate::config::ReadyStateConfig;

/// Buffering level of the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReadyState {
    /// No project loaded
    #[default]
    NoData,
    /// Project metadata known, nothing decoded
    MetaData,
    /// The frame for the current position is available
    CurrentData,
    /// Enough is buffered to keep playing
    EnoughData,
}

impl ReadyState {
    /// True when playback can make progress
    pub fn can_play(self) -> bool {
        self >= ReadyState::CurrentData
    }
}

/// Buffer levels sampled on a render tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferLevels {
    pub has_project: bool,
    pub video_frames: usize,
    pub audio_ms: u64,
    /// The video track has nothing more to decode
    pub video_ended: bool,
}

impl BufferLevels {
    pub fn ready_state(&self, config: &ReadyStateConfig) -> ReadyState {
        if !self.has_project {
            return ReadyState::NoData;
        }
        if self.video_ended
            || (self.video_frames >= config.enough_video_frames && self.audio_ms >= config.enough_audio_ms)
        {
            return ReadyState::EnoughData;
        }
        if self.video_frames >= 1 {
            return ReadyState::CurrentData;
        }
        ReadyState::MetaData
    }
}

/// Tracks the current ready state and when it was entered
#[derive(Debug)]
pub struct ReadyStateTracker {
    config: ReadyStateConfig,
    state: ReadyState,
    entered_at: Instant,
}

impl ReadyStateTracker {
    pub fn new(config: ReadyStateConfig) -> Self {
        Self {
            config,
            state: ReadyState::NoData,
            entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ReadyState {
        self.state
    }

    /// Feeds a new sample; returns the new state if it changed
    pub fn update(&mut self, levels: BufferLevels, now: Instant) -> Option<ReadyState> {
        let target = levels.ready_state(&self.config);
        if target == self.state {
            return None;
        }
        // Losing the project is immediate
        let downgrade_allowed = target == ReadyState::NoData
            || now.saturating_duration_since(self.entered_at) >= self.config.min_dwell();
        if target < self.state && !downgrade_allowed {
            return None;
        }
        tracing::debug!(from = ?self.state, to = ?target, "ready state changed");
        self.state = target;
        self.entered_at = now;
        Some(target)
    }

    /// Forces `state`, e.g. after a project change
    pub fn reset(&mut self, state: ReadyState, now: Instant) {
        self.state = state;
        self.entered_at = now;
    }
}
