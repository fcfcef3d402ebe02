//! Per-frame mask arithmetic producing the inpainting overlay.
//!
//! Everything here runs in 8-bit three-channel space. Single-channel 8-bit
//! inputs are broadcast to three channels first; the selfie mask is the one
//! float input and is quantised before thresholding.

use anyhow::{Context, Result, bail};
use opencv::{
    core::{self, Mat, Point, Scalar, Size},
    imgproc,
    prelude::*,
};

use crate::inpainting::config::SELFIE_MASK_THRESHOLD;

/// The four matrices retrieved for one submitted frame.
pub struct OutputMats {
    /// Composited frame in RGB order.
    pub video: Mat,
    pub corpus_mask: Mat,
    pub face_mask: Mat,
    /// `CV_32FC1` probabilities in `[0, 1]`.
    pub selfie_mask: Mat,
}

impl OutputMats {
    /// Fail unless all four outputs share the video's geometry.
    pub fn ensure_same_size(&self) -> Result<Size> {
        let size = self.video.size()?;
        for (name, mat) in [
            ("corpus mask", &self.corpus_mask),
            ("face mask", &self.face_mask),
            ("selfie mask", &self.selfie_mask),
        ] {
            let other = mat.size()?;
            if other != size {
                bail!(
                    "{name} is {}x{} but the video frame is {}x{}",
                    other.width,
                    other.height,
                    size.width,
                    size.height
                );
            }
        }
        Ok(size)
    }
}

/// Build the BGR frame handed to the sink: the video frame with the
/// inpainting region added on top.
pub fn compose(outputs: &OutputMats) -> Result<Mat> {
    outputs.ensure_same_size()?;

    let mut video_bgr = Mat::default();
    imgproc::cvt_color_def(&outputs.video, &mut video_bgr, imgproc::COLOR_RGB2BGR)
        .context("converting composited frame to BGR")?;

    let corpus = to_three_channels(&outputs.corpus_mask).context("corpus mask")?;
    let face = face_interior(&outputs.face_mask).context("face mask")?;
    let selfie = selfie_region(&outputs.selfie_mask).context("selfie mask")?;
    let region = inpainting_mask(&selfie, &corpus, &face)?;
    overlay(&video_bgr, &region)
}

/// Flood-fill the background from the top-left corner with white, then
/// invert, leaving only the area enclosed by the face outline set.
///
/// The corner is assumed to be background. When it lies on or inside a face
/// region the fill never reaches the real background and the result selects
/// the wrong area; that output is passed through unchanged.
pub fn face_interior(face_mask: &Mat) -> Result<Mat> {
    let mut filled = to_three_channels(face_mask)?;
    imgproc::flood_fill_def(&mut filled, Point::new(0, 0), Scalar::all(255.0))?;
    let mut inverted = Mat::default();
    core::bitwise_not_def(&filled, &mut inverted)?;
    Ok(inverted)
}

/// Quantise a `[0, 1]` probability mask to 8 bits, broadcast it to three
/// channels and binarise it: intensities above the threshold become 255.
pub fn selfie_region(selfie_mask: &Mat) -> Result<Mat> {
    if selfie_mask.typ() != core::CV_32FC1 {
        bail!(
            "expected a single-channel float selfie mask, got type {}",
            selfie_mask.typ()
        );
    }
    let mut intensity = Mat::default();
    selfie_mask.convert_to(&mut intensity, core::CV_8U, 255.0, 0.0)?;
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&intensity, &mut rgb, imgproc::COLOR_GRAY2RGB)?;
    let mut binary = Mat::default();
    imgproc::threshold(
        &rgb,
        &mut binary,
        SELFIE_MASK_THRESHOLD,
        255.0,
        imgproc::THRESH_BINARY,
    )?;
    Ok(binary)
}

/// `(selfie AND corpus) - face`, saturating at zero.
pub fn inpainting_mask(selfie: &Mat, corpus: &Mat, face: &Mat) -> Result<Mat> {
    let mut both = Mat::default();
    core::bitwise_and_def(selfie, corpus, &mut both)?;
    let mut region = Mat::default();
    core::subtract_def(&both, face, &mut region)?;
    Ok(region)
}

/// Saturating per-pixel sum of the frame and the region mask.
pub fn overlay(frame: &Mat, region: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    core::add_def(frame, region, &mut out)?;
    Ok(out)
}

fn to_three_channels(mask: &Mat) -> Result<Mat> {
    match mask.typ() {
        core::CV_8UC3 => Ok(mask.try_clone()?),
        core::CV_8UC1 => {
            let mut rgb = Mat::default();
            imgproc::cvt_color_def(mask, &mut rgb, imgproc::COLOR_GRAY2RGB)?;
            Ok(rgb)
        }
        other => bail!("expected an 8-bit mask with 1 or 3 channels, got type {other}"),
    }
}
