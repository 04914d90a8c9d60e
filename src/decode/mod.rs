pub mod frame;
pub mod stream_info;
pub mod video_context;
pub mod video_service;

pub use frame::{DecodedFrameUnit, DecodedPicture, PixelFormat, Plane};
pub use stream_info::{AudioStreamInfo, IndexEntry, VideoStreamInfo};
pub use video_context::{GopIndex, SeekAction, VideoDecodeContext};
pub use video_service::{FrameLookup, VideoDecodeService};
