//! Frame acquisition and video output on top of OpenCV `videoio`.
//!
//! A [`VideoSource`] opens either a file or the default camera and yields
//! raw BGR frames; [`to_graph_frame`] turns them into the RGB layout (mirrored
//! for cameras) that graph inputs expect. [`VideoFileWriter`] encodes
//! composited frames to disk.

pub mod capture;
pub mod types;
pub mod writer;

pub use capture::{DEFAULT_CAMERA_INDEX, FrameSource, VideoSource, to_graph_frame};
pub use types::{CaptureError, SourceKind};
pub use writer::{FALLBACK_FPS, FrameWriter, VideoFileWriter};
