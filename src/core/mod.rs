//! Core types for timeline playback.
//!
//! This module provides the project model, the timeline segmentation, the
//! bounded queue shared by the decode services, and time helpers. Render
//! positions are seconds (f64) throughout.

pub mod project;
pub mod queue;
pub mod time;
pub mod timeline;

// Re-export core data structures for easier access.
pub use project::{AudioAsset, MediaAsset, MediaFileInfo, Project, TimeRange};
pub use queue::BoundedQueue;
pub use time::{Rational, PTS_EPS, TIME_EPS};
pub use timeline::{Segment, Timeline};
