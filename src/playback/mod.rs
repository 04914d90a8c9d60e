pub mod engine;
pub mod state;
pub mod sync;

pub use engine::{PlaybackController, PlaybackError, PlayerEvent};
pub use state::{BufferLevels, ReadyState, ReadyStateTracker};
pub use sync::{ClockMessageCenter, ReferenceClock};
