//! Conversion between OpenCV matrices and graph image frames.

use anyhow::{Context, Result, bail};
use graph_runtime::{ImageFormat, ImageFrame};
use opencv::{
    core::{self, Mat, Scalar},
    prelude::*,
};

/// Copy an RGB `CV_8UC3` matrix into an [`ImageFormat::Srgb`] frame.
pub fn mat_to_frame(mat: &Mat) -> Result<ImageFrame> {
    let format = match mat.typ() {
        core::CV_8UC3 => ImageFormat::Srgb,
        core::CV_8UC4 => ImageFormat::Srgba,
        core::CV_8UC1 => ImageFormat::Gray8,
        core::CV_32FC1 => ImageFormat::Vec32f1,
        other => bail!("unsupported matrix type {other} for graph input"),
    };
    let width = u32::try_from(mat.cols()).context("negative matrix width")?;
    let height = u32::try_from(mat.rows()).context("negative matrix height")?;

    let data = if mat.is_continuous() {
        mat.data_bytes()?.to_vec()
    } else {
        mat.try_clone()?.data_bytes()?.to_vec()
    };
    Ok(ImageFrame::from_bytes(format, width, height, data)?)
}

/// Deep-copy a graph frame into a freshly allocated matrix.
pub fn frame_to_mat(frame: &ImageFrame) -> Result<Mat> {
    let typ = match frame.format() {
        ImageFormat::Srgb => core::CV_8UC3,
        ImageFormat::Srgba => core::CV_8UC4,
        ImageFormat::Gray8 => core::CV_8UC1,
        ImageFormat::Vec32f1 => core::CV_32FC1,
    };
    let rows = i32::try_from(frame.height()).context("frame too tall")?;
    let cols = i32::try_from(frame.width()).context("frame too wide")?;
    let mut mat = Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(frame.data());
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use opencv::core::Vec3b;

    use super::*;

    #[test]
    fn rgb_pixels_survive_conversion() {
        let mut mat = Mat::new_rows_cols_with_default(2, 3, core::CV_8UC3, Scalar::all(0.0)).unwrap();
        *mat.at_2d_mut::<Vec3b>(1, 2).unwrap() = Vec3b::from([10, 20, 30]);

        let frame = mat_to_frame(&mat).unwrap();
        assert_eq!(frame.format(), ImageFormat::Srgb);
        assert_eq!(frame.dimensions(), (3, 2));
        let offset = frame.width_step() + 2 * 3;
        assert_eq!(&frame.data()[offset..offset + 3], &[10, 20, 30]);

        let back = frame_to_mat(&frame).unwrap();
        assert_eq!(*back.at_2d::<Vec3b>(1, 2).unwrap(), Vec3b::from([10, 20, 30]));
    }

    #[test]
    fn float_masks_map_to_single_channel_float() {
        let frame = ImageFrame::from_f32(2, 1, &[0.25, 1.0]).unwrap();
        let mat = frame_to_mat(&frame).unwrap();
        assert_eq!(mat.typ(), core::CV_32FC1);
        assert_eq!(*mat.at_2d::<f32>(0, 1).unwrap(), 1.0);
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let mat = Mat::new_rows_cols_with_default(1, 1, core::CV_16UC3, Scalar::all(0.0)).unwrap();
        assert!(mat_to_frame(&mat).is_err());
    }
}
