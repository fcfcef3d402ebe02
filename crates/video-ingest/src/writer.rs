//! Video file output.

use std::path::{Path, PathBuf};

use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::VideoWriter,
};
use tracing::{info, warn};

use crate::types::CaptureError;

/// Rate used when the capture backend cannot report one.
pub const FALLBACK_FPS: f64 = 30.0;

/// Sink for encoded frames.
pub trait FrameWriter {
    fn write(&mut self, frame: &Mat) -> Result<(), CaptureError>;

    /// Flush and close the container. Safe to call more than once.
    fn release(&mut self) -> Result<(), CaptureError>;
}

/// H.264 `.mp4` writer backed by `videoio`.
pub struct VideoFileWriter {
    writer: VideoWriter,
    path: PathBuf,
    frames: u64,
}

impl VideoFileWriter {
    /// Open an `avc1` writer for frames of `size` at `fps`.
    pub fn open(path: &Path, fps: f64, size: Size) -> Result<Self, CaptureError> {
        Self::open_with_codec(path, ['a', 'v', 'c', '1'], fps, size)
    }

    pub fn open_with_codec(
        path: &Path,
        codec: [char; 4],
        fps: f64,
        size: Size,
    ) -> Result<Self, CaptureError> {
        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            warn!(
                "capture reported {fps} fps; writing at {FALLBACK_FPS} fps instead of the reported rate"
            );
            FALLBACK_FPS
        };
        let fourcc = VideoWriter::fourcc(codec[0], codec[1], codec[2], codec[3])?;
        let filename = path.to_string_lossy();
        let writer = VideoWriter::new(&filename, fourcc, fps, size, true)?;
        if !writer.is_opened()? {
            return Err(CaptureError::WriterOpen {
                path: path.to_path_buf(),
            });
        }
        info!(
            "Writing {}x{} @ {fps:.2} fps to {}",
            size.width,
            size.height,
            path.display()
        );
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            frames: 0,
        })
    }
}

impl FrameWriter for VideoFileWriter {
    fn write(&mut self, frame: &Mat) -> Result<(), CaptureError> {
        self.writer.write(frame)?;
        self.frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if self.writer.is_opened()? {
            self.writer.release()?;
            info!("Finalised {} ({} frame(s))", self.path.display(), self.frames);
        }
        Ok(())
    }
}
