//! Stroke raster normalization.
//!
//! Turns whatever the user drew into the 28×28 grid the network was trained
//! on: locate the ink, pad it, square it up, resample, and scale the peak to
//! one.
//!
//! ```
//! use apr_digits::normalize::raster_to_tensor;
//! use apr_digits::raster::Raster;
//!
//! let blank = Raster::blank(280, 280);
//! let tensor = raster_to_tensor(&blank);
//! assert!(tensor.is_blank());
//! ```

pub mod crop;
pub mod resample;

pub use crop::{crop_to_square, find_ink, BoundingBox, Crop};
pub use resample::resample_to_grid;

use crate::config::NormalizeConfig;
use crate::error::Result;
use crate::raster::Raster;
use crate::tensor::CanonicalTensor;

/// Normalize `raster` with the default settings.
///
/// Never fails: a canvas without ink yields the all-zero tensor.
#[must_use]
pub fn raster_to_tensor(raster: &Raster) -> CanonicalTensor {
    Normalizer::default().normalize(raster)
}

/// Crop-and-resample pipeline with explicit settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    config: NormalizeConfig,
}

impl Normalizer {
    /// Create a normalizer.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` if `config.channel` is not an RGBA
    /// channel.
    pub fn new(config: NormalizeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    /// Ink bounding box before padding, if any ink is present.
    #[must_use]
    pub fn bounding_box(&self, raster: &Raster) -> Option<BoundingBox> {
        find_ink(raster, self.config.ink_threshold, self.config.channel)
    }

    /// Run the full pipeline.
    #[must_use]
    pub fn normalize(&self, raster: &Raster) -> CanonicalTensor {
        match crop_to_square(raster, &self.config) {
            Crop::Square(square) => resample_to_grid(&square, self.config.channel),
            Crop::Empty => {
                tracing::debug!(
                    width = raster.width(),
                    height = raster.height(),
                    "no ink found, returning blank tensor"
                );
                CanonicalTensor::zeros()
            }
        }
    }
}
