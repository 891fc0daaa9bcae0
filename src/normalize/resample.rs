//! Downsampling of the square crop onto the canonical grid.

use crate::tensor::{CanonicalTensor, GRID_SIZE};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbaImage};

/// Single-channel `f32` plane the resize runs on, so faint strokes are not
/// quantized away before peak normalization.
type IntensityPlane = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Resample `square` to 28×28 and scale its peak to exactly `1.0`.
///
/// The triangle filter widens its support when shrinking, which makes it
/// behave as area averaging and keeps thin strokes continuous.
#[must_use]
pub fn resample_to_grid(square: &RgbaImage, channel: usize) -> CanonicalTensor {
    let plane: IntensityPlane = ImageBuffer::from_fn(square.width(), square.height(), |x, y| {
        let value = square.get_pixel(x, y).0.get(channel).copied().unwrap_or(0);
        Luma([f32::from(value) / 255.0])
    });
    let grid = GRID_SIZE as u32;
    let resized = imageops::resize(&plane, grid, grid, FilterType::Triangle);

    let mut values = resized.into_raw();
    scale_to_unit_peak(&mut values);
    CanonicalTensor::from_normalized(values)
}

/// Divide every value by the maximum; all-zero input is left untouched.
pub(crate) fn scale_to_unit_peak(values: &mut [f32]) {
    let peak = values.iter().copied().fold(0.0_f32, f32::max);
    if peak > 0.0 {
        for v in values.iter_mut() {
            *v = (*v / peak).clamp(0.0, 1.0);
        }
    }
}
