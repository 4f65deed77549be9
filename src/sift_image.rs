use image::buffer::ConvertBuffer;
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{ArrayView2, ShapeBuilder};

use crate::error::SiftError;

pub type LumaFImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Rows are padded to a multiple of this many floats.
const ROW_ALIGN: usize = 128;

/// Single channel float image the detector runs on.
///
/// Pixels are stored row-major with every row starting at a multiple of `pitch` floats. Padding
/// is zero and never read by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SiftImage {
    width: u32,
    height: u32,
    pitch: usize,
    data: Vec<f32>,
}

impl SiftImage {
    /// Copy `pixels`, laid out row-major without padding, into a pitched image.
    pub fn from_row_major(width: u32, height: u32, pixels: &[f32]) -> Result<Self, SiftError> {
        if width == 0 || height == 0 {
            return Err(SiftError::InvalidImage(format!(
                "dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(SiftError::InvalidImage(format!(
                "expected {expected} pixels for {width}x{height}, got {}",
                pixels.len()
            )));
        }
        let pitch = (width as usize).next_multiple_of(ROW_ALIGN);
        let mut data = vec![0.0; pitch * height as usize];
        data.chunks_exact_mut(pitch)
            .zip(pixels.chunks_exact(width as usize))
            .for_each(|(dst, src)| dst[..width as usize].copy_from_slice(src));
        Ok(Self {
            width,
            height,
            pitch,
            data,
        })
    }

    pub fn from_luma32f(img: &LumaFImage) -> Result<Self, SiftError> {
        Self::from_row_major(img.width(), img.height(), img.as_raw())
    }

    /// 8 bit images are scaled to `[0, 1]`.
    pub fn from_gray(img: &GrayImage) -> Result<Self, SiftError> {
        let img_f32: LumaFImage = img.convert();
        Self::from_luma32f(&img_f32)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between the starts of two consecutive rows, in floats.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn row(&self, y: u32) -> &[f32] {
        let start = y as usize * self.pitch;
        &self.data[start..start + self.width as usize]
    }

    /// `(height, width)` view skipping the row padding.
    pub fn view(&self) -> ArrayView2<f32> {
        ArrayView2::from_shape(
            (self.height as usize, self.width as usize).strides((self.pitch, 1)),
            &self.data,
        )
        .expect("pitch covers every row")
    }

    pub(crate) fn to_luma32f(&self) -> LumaFImage {
        LumaFImage::from_fn(self.width, self.height, |x, y| {
            Luma([self.data[y as usize * self.pitch + x as usize]])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded() {
        let pixels: Vec<f32> = (0..(130 * 3)).map(|v| v as f32).collect();
        let img = SiftImage::from_row_major(130, 3, &pixels).unwrap();
        assert_eq!(img.pitch(), 256);
        assert_eq!(img.row(1)[0], 130.0);
        assert_eq!(img.row(2)[129], 389.0);
        let view = img.view();
        assert_eq!(view.dim(), (3, 130));
        assert_eq!(view[(2, 5)], 265.0);
        assert_eq!(img.to_luma32f().get_pixel(5, 2)[0], 265.0);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            SiftImage::from_row_major(4, 4, &[0.0; 15]),
            Err(SiftError::InvalidImage(_))
        ));
        assert!(SiftImage::from_row_major(0, 4, &[]).is_err());
    }

    #[test]
    fn gray_is_normalized() {
        let gray = GrayImage::from_fn(8, 8, |x, _| image::Luma([if x < 4 { 0 } else { 255 }]));
        let img = SiftImage::from_gray(&gray).unwrap();
        assert_eq!(img.row(0)[0], 0.0);
        assert_eq!(img.row(7)[7], 1.0);
    }
}
