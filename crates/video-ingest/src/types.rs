use std::path::PathBuf;

use thiserror::Error;

/// Where frames come from. Cameras and files differ in how empty grabs are
/// treated and whether frames are mirrored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Live device; frames are mirrored for a selfie view.
    Camera,
    /// Pre-recorded video file.
    File,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to open video writer for {path:?}")]
    WriterOpen { path: PathBuf },
    #[error("frame has unsupported layout: {0}")]
    Layout(String),
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}
