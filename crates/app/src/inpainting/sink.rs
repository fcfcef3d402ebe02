//! Where composited frames go: a preview window or a capped recording.

use anyhow::{Context, Result};
use opencv::{
    core::{Mat, Size},
    highgui,
    prelude::*,
};
use tracing::{debug, info};
use video_ingest::{CaptureError, FrameWriter};

use crate::inpainting::config::{KEY_POLL_INTERVAL_MS, NO_KEY_SENTINEL, RECORD_FRAME_LIMIT};

/// What the frame loop should do after a sink has consumed a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    /// The recording reached its frame cap.
    FrameLimit,
    /// The viewer pressed a key.
    KeyPressed,
}

pub trait FrameSink {
    /// Consume one BGR frame.
    fn consume(&mut self, frame: &Mat) -> Result<SinkControl>;

    /// Release whatever the sink holds. Called once on every exit path.
    fn finish(&mut self) -> Result<()>;
}

/// Minimal display surface used by [`WindowSink`].
pub trait PreviewSurface {
    fn show(&mut self, frame: &Mat) -> Result<()>;

    /// Wait up to `delay_ms` for a key press; negative when none arrived.
    fn poll_key(&mut self, delay_ms: i32) -> Result<i32>;

    fn close(&mut self) -> Result<()>;
}

/// A named `highgui` window.
pub struct HighguiWindow {
    name: String,
    open: bool,
}

impl HighguiWindow {
    pub fn open(name: &str) -> Result<Self> {
        highgui::named_window(name, highgui::WINDOW_AUTOSIZE)
            .with_context(|| format!("opening window {name:?}"))?;
        Ok(Self {
            name: name.to_string(),
            open: true,
        })
    }
}

impl PreviewSurface for HighguiWindow {
    fn show(&mut self, frame: &Mat) -> Result<()> {
        highgui::imshow(&self.name, frame)?;
        Ok(())
    }

    fn poll_key(&mut self, delay_ms: i32) -> Result<i32> {
        Ok(highgui::wait_key(delay_ms)?)
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            highgui::destroy_window(&self.name)?;
        }
        Ok(())
    }
}

/// Whether a polled key code should end an interactive session. Some
/// backends report 255 instead of -1 when nothing was pressed.
pub fn key_requests_stop(key: i32) -> bool {
    key >= 0 && key != NO_KEY_SENTINEL
}

/// Interactive preview: show each frame and stop on any key press.
pub struct WindowSink<S> {
    surface: S,
    shown: u64,
}

impl<S: PreviewSurface> WindowSink<S> {
    pub fn new(surface: S) -> Self {
        Self { surface, shown: 0 }
    }
}

impl<S: PreviewSurface> FrameSink for WindowSink<S> {
    fn consume(&mut self, frame: &Mat) -> Result<SinkControl> {
        self.surface.show(frame)?;
        self.shown += 1;
        let key = self.surface.poll_key(KEY_POLL_INTERVAL_MS)?;
        if key_requests_stop(key) {
            info!("Key {key} pressed after {} frame(s); stopping", self.shown);
            return Ok(SinkControl::KeyPressed);
        }
        Ok(SinkControl::Continue)
    }

    fn finish(&mut self) -> Result<()> {
        self.surface.close()
    }
}

/// Writes frames to a video file opened lazily from the first frame's
/// geometry, stopping after [`RECORD_FRAME_LIMIT`] frames.
pub struct RecordingSink<W, O> {
    open_writer: O,
    writer: Option<W>,
    written: usize,
}

impl<W, O> RecordingSink<W, O>
where
    W: FrameWriter,
    O: FnMut(Size) -> Result<W, CaptureError>,
{
    /// `open_writer` receives the first frame's size and must return an
    /// opened writer.
    pub fn new(open_writer: O) -> Self {
        Self {
            open_writer,
            writer: None,
            written: 0,
        }
    }
}

impl<W, O> FrameSink for RecordingSink<W, O>
where
    W: FrameWriter,
    O: FnMut(Size) -> Result<W, CaptureError>,
{
    fn consume(&mut self, frame: &Mat) -> Result<SinkControl> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                info!("Prepare video writer.");
                let size = frame.size()?;
                let writer = (self.open_writer)(size).context("opening video writer")?;
                self.writer.insert(writer)
            }
        };
        writer.write(frame).context("writing frame")?;
        debug!("Writing frame {}...", self.written);
        self.written += 1;
        if self.written >= RECORD_FRAME_LIMIT {
            info!("Recorded {RECORD_FRAME_LIMIT} frames; stopping");
            return Ok(SinkControl::FrameLimit);
        }
        Ok(SinkControl::Continue)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.release().context("finalising video writer")?;
        }
        Ok(())
    }
}
