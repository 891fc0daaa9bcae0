//! Ink bounding box detection and square cropping.
//!
//! The crop is centred on the ink's bounding box, not on its centre of mass.

use crate::config::NormalizeConfig;
use crate::raster::Raster;
use image::{imageops, Rgba, RgbaImage};

/// Inclusive extents of the ink, in raster coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    fn at(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn include(self, x: u32, y: u32) -> Self {
        Self {
            min_x: self.min_x.min(x),
            min_y: self.min_y.min(y),
            max_x: self.max_x.max(x),
            max_y: self.max_y.max(y),
        }
    }

    /// Width in pixels (inclusive extents).
    #[must_use]
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    /// Height in pixels (inclusive extents).
    #[must_use]
    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Outcome of the crop stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Crop {
    /// No ink pixel was found; a blank canvas, not a failure.
    Empty,
    /// The padded ink region, centred on an opaque black square of side
    /// `max(width, height)`.
    Square(RgbaImage),
}

/// Locate the ink.
///
/// A pixel is ink when `channel` is strictly greater than `threshold`.
#[must_use]
pub fn find_ink(raster: &Raster, threshold: u8, channel: usize) -> Option<BoundingBox> {
    raster
        .as_image()
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0.get(channel).is_some_and(|&v| v > threshold))
        .fold(None, |bbox, (x, y, _)| {
            Some(bbox.map_or_else(|| BoundingBox::at(x, y), |b: BoundingBox| b.include(x, y)))
        })
}

/// Crop the padded ink region and square it up.
#[must_use]
pub fn crop_to_square(raster: &Raster, config: &NormalizeConfig) -> Crop {
    match find_ink(raster, config.ink_threshold, config.channel) {
        Some(bbox) => Crop::Square(square_region(raster, bbox, config.padding)),
        None => Crop::Empty,
    }
}

pub(crate) fn square_region(raster: &Raster, bbox: BoundingBox, padding: u32) -> RgbaImage {
    let left = bbox.min_x.saturating_sub(padding);
    let top = bbox.min_y.saturating_sub(padding);
    let right = (bbox.max_x + 1).saturating_add(padding).min(raster.width());
    let bottom = (bbox.max_y + 1).saturating_add(padding).min(raster.height());

    let box_w = right - left;
    let box_h = bottom - top;
    let side = box_w.max(box_h);

    let region = imageops::crop_imm(raster.as_image(), left, top, box_w, box_h).to_image();
    let mut square = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 255]));
    let offset_x = (side - box_w) / 2;
    let offset_y = (side - box_h) / 2;
    imageops::replace(
        &mut square,
        &region,
        i64::from(offset_x),
        i64::from(offset_y),
    );

    tracing::debug!(
        left,
        top,
        box_w,
        box_h,
        side,
        "cropped ink region"
    );
    square
}
