//! OpenCV-backed frame acquisition from the default camera or a video file.

use std::path::Path;

use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, info, warn};

use crate::types::{CaptureError, SourceKind};

/// Device index opened when no input file is given.
pub const DEFAULT_CAMERA_INDEX: i32 = 0;

/// Sequential, non-restartable supply of raw frames.
pub trait FrameSource {
    fn kind(&self) -> SourceKind;

    /// Grab the next frame in the capture's native (BGR) channel order.
    /// `Ok(None)` means the grab came back empty.
    fn grab(&mut self) -> Result<Option<Mat>, CaptureError>;

    /// Frame rate reported by the backend; `0.0` when unknown.
    fn frame_rate(&self) -> f64;

    /// Best-effort request for a capture resolution and rate.
    fn request_format(&mut self, width: i32, height: i32, fps: f64);

    fn release(&mut self) -> Result<(), CaptureError>;
}

/// A camera or file opened through `videoio`.
pub struct VideoSource {
    capture: VideoCapture,
    kind: SourceKind,
    uri: String,
    frames: u64,
}

impl VideoSource {
    /// Open `input` when given, the default camera otherwise.
    pub fn open(input: Option<&Path>) -> Result<Self, CaptureError> {
        let (capture, kind, uri) = match input {
            Some(path) => {
                let uri = path.display().to_string();
                (open_file(&uri)?, SourceKind::File, uri)
            }
            None => (
                open_camera(DEFAULT_CAMERA_INDEX)?,
                SourceKind::Camera,
                format!("camera #{DEFAULT_CAMERA_INDEX}"),
            ),
        };
        info!("Opened {uri} ({kind:?})");
        Ok(Self {
            capture,
            kind,
            uri,
            frames: 0,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl FrameSource for VideoSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn grab(&mut self) -> Result<Option<Mat>, CaptureError> {
        let mut frame = Mat::default();
        let grabbed = self.capture.read(&mut frame)?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        self.frames += 1;
        Ok(Some(frame))
    }

    fn frame_rate(&self) -> f64 {
        self.capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0)
    }

    fn request_format(&mut self, width: i32, height: i32, fps: f64) {
        for (prop, value, label) in [
            (videoio::CAP_PROP_FRAME_WIDTH, width as f64, "width"),
            (videoio::CAP_PROP_FRAME_HEIGHT, height as f64, "height"),
            (videoio::CAP_PROP_FPS, fps, "fps"),
        ] {
            if !matches!(self.capture.set(prop, value), Ok(true)) {
                debug!("{}: backend ignored {label}={value}", self.uri);
            }
        }
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if self.capture.is_opened()? {
            self.capture.release()?;
            info!("Released {} after {} frame(s)", self.uri, self.frames);
        }
        Ok(())
    }
}

fn open_camera(index: i32) -> Result<VideoCapture, CaptureError> {
    #[cfg(target_os = "linux")]
    let backends = [videoio::CAP_V4L, videoio::CAP_ANY];
    #[cfg(not(target_os = "linux"))]
    let backends = [videoio::CAP_ANY];

    for backend in backends {
        match VideoCapture::new(index, backend) {
            Ok(cap) if cap.is_opened()? => return Ok(cap),
            Ok(_) => debug!("camera #{index} not available via backend {backend}"),
            Err(err) => warn!("failed to open camera #{index} with backend {backend}: {err}"),
        }
    }
    Err(CaptureError::Open {
        uri: format!("camera #{index}"),
    })
}

fn open_file(uri: &str) -> Result<VideoCapture, CaptureError> {
    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) if cap.is_opened()? => Ok(cap),
        Ok(_) => Err(CaptureError::Open {
            uri: uri.to_string(),
        }),
        Err(err) => {
            warn!("failed to open {uri}: {err}");
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        }
    }
}

/// Convert a raw BGR capture into the RGB layout the graph consumes,
/// mirroring camera frames horizontally.
pub fn to_graph_frame(raw: &Mat, kind: SourceKind) -> Result<Mat, CaptureError> {
    if raw.typ() != core::CV_8UC3 {
        return Err(CaptureError::Layout(format!(
            "expected 8-bit 3-channel capture, got type {}",
            raw.typ()
        )));
    }
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(raw, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    if kind == SourceKind::File {
        return Ok(rgb);
    }
    let mut mirrored = Mat::default();
    core::flip(&rgb, &mut mirrored, 1)?;
    Ok(mirrored)
}

#[cfg(test)]
mod tests {
    use opencv::core::{Scalar, Vec3b};

    use super::*;

    /// 2x1 BGR frame: left pixel pure blue, right pixel pure red.
    fn blue_red() -> Mat {
        let mut mat =
            Mat::new_rows_cols_with_default(1, 2, core::CV_8UC3, Scalar::all(0.0)).unwrap();
        *mat.at_2d_mut::<Vec3b>(0, 0).unwrap() = Vec3b::from([255, 0, 0]);
        *mat.at_2d_mut::<Vec3b>(0, 1).unwrap() = Vec3b::from([0, 0, 255]);
        mat
    }

    #[test]
    fn file_frames_are_reordered_but_not_mirrored() {
        let out = to_graph_frame(&blue_red(), SourceKind::File).unwrap();
        assert_eq!(*out.at_2d::<Vec3b>(0, 0).unwrap(), Vec3b::from([0, 0, 255]));
        assert_eq!(*out.at_2d::<Vec3b>(0, 1).unwrap(), Vec3b::from([255, 0, 0]));
    }

    #[test]
    fn camera_frames_are_mirrored() {
        let out = to_graph_frame(&blue_red(), SourceKind::Camera).unwrap();
        // Red (RGB [255, 0, 0]) moves to the left edge.
        assert_eq!(*out.at_2d::<Vec3b>(0, 0).unwrap(), Vec3b::from([255, 0, 0]));
        assert_eq!(*out.at_2d::<Vec3b>(0, 1).unwrap(), Vec3b::from([0, 0, 255]));
    }

    #[test]
    fn rejects_non_color_frames() {
        let gray = Mat::new_rows_cols_with_default(2, 2, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        assert!(matches!(
            to_graph_frame(&gray, SourceKind::File),
            Err(CaptureError::Layout(_))
        ));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = VideoSource::open(Some(Path::new("/nonexistent/clip.mp4")))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}
