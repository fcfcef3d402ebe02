//! Owned pixel buffers carried inside packets.

use crate::error::GraphError;

/// Pixel layout of an [`ImageFrame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// 8-bit RGB.
    Srgb,
    /// 8-bit RGBA.
    Srgba,
    /// 8-bit single channel.
    Gray8,
    /// 32-bit float single channel, native endian.
    Vec32f1,
}

impl ImageFormat {
    pub fn channels(self) -> usize {
        match self {
            ImageFormat::Srgb => 3,
            ImageFormat::Srgba => 4,
            ImageFormat::Gray8 | ImageFormat::Vec32f1 => 1,
        }
    }

    pub fn byte_depth(self) -> usize {
        match self {
            ImageFormat::Vec32f1 => 4,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.channels() * self.byte_depth()
    }
}

/// Tightly packed image buffer (row stride == `width * bytes_per_pixel`).
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    format: ImageFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ImageFrame {
    /// Wrap `data` after checking it matches the declared geometry.
    pub fn from_bytes(
        format: ImageFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self, GraphError> {
        if width == 0 || height == 0 {
            return Err(GraphError::ImageFrame(format!(
                "empty geometry {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(GraphError::ImageFrame(format!(
                "{format:?} {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            format,
            width,
            height,
            data,
        })
    }

    /// Zero-filled frame.
    pub fn new(format: ImageFormat, width: u32, height: u32) -> Result<Self, GraphError> {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self::from_bytes(format, width, height, vec![0; len])
    }

    /// Single-channel float frame, typically a probability mask in `[0, 1]`.
    pub fn from_f32(width: u32, height: u32, values: &[f32]) -> Result<Self, GraphError> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(ImageFormat::Vec32f1, width, height, data)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn width_step(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Decode a [`ImageFormat::Vec32f1`] buffer back into floats.
    pub fn to_f32(&self) -> Result<Vec<f32>, GraphError> {
        if self.format != ImageFormat::Vec32f1 {
            return Err(GraphError::ImageFrame(format!(
                "{:?} frame has no float view",
                self.format
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        let err = ImageFrame::from_bytes(ImageFormat::Srgb, 2, 2, vec![0; 11]).unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes"));
    }

    #[test]
    fn rejects_empty_geometry() {
        assert!(ImageFrame::new(ImageFormat::Gray8, 0, 4).is_err());
    }

    #[test]
    fn float_frames_keep_their_values() {
        let frame = ImageFrame::from_f32(2, 1, &[0.25, 1.0]).unwrap();
        assert_eq!(frame.format(), ImageFormat::Vec32f1);
        assert_eq!(frame.width_step(), 8);
        assert_eq!(frame.to_f32().unwrap(), vec![0.25, 1.0]);
    }

    #[test]
    fn byte_frames_have_no_float_view() {
        let frame = ImageFrame::new(ImageFormat::Srgb, 1, 1).unwrap();
        assert!(frame.to_f32().is_err());
    }
}
