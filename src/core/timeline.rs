//! Timeline: maps project render positions onto the media asset that is
//! visible at that position.
//!
//! Segments are laid end to end in asset order, so they partition
//! `[0, duration)` with no gaps or overlaps. Assets that failed to probe keep
//! a zero-length segment so indices stay aligned with the project.

use crate::core::project::Project;
use crate::core::time::TIME_EPS;

/// The stretch of the timeline occupied by one media asset
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Segment {
    pub asset_index: usize,
    pub asset_id: u64,
    pub start: f64,       // Project seconds
    pub end: f64,         // Project seconds, exclusive
    pub clip_start: f64,  // Asset-local position shown at `start`
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.duration() < TIME_EPS
    }

    /// Converts a project position to a position inside the asset file
    pub fn to_asset_position(&self, render_pos: f64) -> f64 {
        self.clip_start + (render_pos - self.start)
    }

    /// Converts a position inside the asset file to project time
    pub fn to_project_position(&self, asset_pos: f64) -> f64 {
        self.start + (asset_pos - self.clip_start)
    }

    fn same_bounds(&self, other: &Segment) -> bool {
        (self.start - other.start).abs() < TIME_EPS && (self.end - other.end).abs() < TIME_EPS
    }
}

/// Ordered segments of a project
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    segments: Vec<Segment>,
}

impl Timeline {
    /// Builds the segments from the project's cached probe results
    pub fn new(project: &Project) -> Self {
        if project.media_assets.is_empty() {
            tracing::warn!(project_id = project.project_id, "timeline built from a project with no media assets");
        }
        let mut segments = Vec::with_capacity(project.media_assets.len());
        let mut start = 0.0;
        for (asset_index, asset) in project.media_assets.iter().enumerate() {
            let clipped = asset.clipped_range();
            segments.push(Segment {
                asset_index,
                asset_id: asset.asset_id,
                start,
                end: start + clipped.duration,
                clip_start: clipped.start,
            });
            start += clipped.duration;
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total length in seconds
    pub fn duration(&self) -> f64 {
        self.segments.last().map_or(0.0, |s| s.end)
    }

    /// Segment containing `render_pos`; positions past the end resolve to the
    /// last playable segment.
    pub fn segment_at(&self, render_pos: f64) -> Option<Segment> {
        self.segments
            .iter()
            .find(|s| render_pos + TIME_EPS > s.start && render_pos < s.end)
            .or_else(|| self.segments.iter().rev().find(|s| !s.is_empty()))
            .or_else(|| self.segments.last())
            .copied()
    }

    /// Segment of a given asset
    pub fn segment_for_asset(&self, asset_index: usize) -> Option<Segment> {
        self.segments.get(asset_index).copied()
    }

    /// True if no playable segment follows `segment`
    pub fn is_last(&self, segment: &Segment) -> bool {
        self.next_segment(segment).is_none()
    }

    /// First playable segment after `segment`
    pub fn next_segment(&self, segment: &Segment) -> Option<Segment> {
        let index = self.segments.iter().position(|s| s.same_bounds(segment) && s.asset_index == segment.asset_index)?;
        self.segments[index + 1..].iter().find(|s| !s.is_empty()).copied()
    }
}
