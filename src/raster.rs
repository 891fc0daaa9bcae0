//! RGBA stroke rasters handed over by the drawing surface.

use crate::error::{DigitError, Result};
use image::{Rgba, RgbaImage};

/// Side of the square drawing canvas the normalization constants were tuned on.
pub const CANVAS_SIZE: u32 = 280;

/// A width×height grid of RGBA pixels.
///
/// Strokes are expected in white on a black (or transparent) background.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    image: RgbaImage,
}

impl Raster {
    /// Wrap raw RGBA bytes (row-major, four bytes per pixel).
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `data.len() != width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(DigitError::dimension_mismatch(
                format!("{expected} bytes ({width}x{height} RGBA)"),
                format!("{} bytes", data.len()),
            ));
        }
        RgbaImage::from_raw(width, height, data)
            .map(Self::from)
            .ok_or_else(|| DigitError::dimension_mismatch(expected, "unusable buffer"))
    }

    /// A fully transparent canvas, as left by clearing the drawing surface.
    #[must_use]
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Pixel at `(x, y)`, or `None` outside the raster.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba<u8>> {
        self.image.get_pixel_checked(x, y).copied()
    }

    /// Overwrite the pixel at `(x, y)`; ignored outside the raster.
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x < self.width() && y < self.height() {
            self.image.put_pixel(x, y, pixel);
        }
    }

    /// Borrow the underlying image.
    #[must_use]
    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    /// Consume the raster and return the underlying image.
    #[must_use]
    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

impl From<RgbaImage> for Raster {
    fn from(image: RgbaImage) -> Self {
        Self { image }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Raster;
    use image::Rgba;

    /// Paint a round-capped white segment, like a pointer drag on the canvas.
    pub(crate) fn stroke(raster: &mut Raster, from: (f32, f32), to: (f32, f32), width: f32) {
        let radius = width / 2.0;
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let len_sq = dx * dx + dy * dy;
        for y in 0..raster.height() {
            for x in 0..raster.width() {
                let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
                let t = if len_sq == 0.0 {
                    0.0
                } else {
                    (((px - from.0) * dx + (py - from.1) * dy) / len_sq).clamp(0.0, 1.0)
                };
                let (cx, cy) = (from.0 + t * dx, from.1 + t * dy);
                if (px - cx).powi(2) + (py - cy).powi(2) <= radius * radius {
                    raster.put_pixel(x, y, Rgba([255, 255, 255, 255]));
                }
            }
        }
    }
}
