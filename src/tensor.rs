//! The canonical 28×28 intensity grid fed to the network.

use crate::error::{DigitError, Result};

/// Side of the canonical grid.
pub const GRID_SIZE: usize = 28;

/// Number of values in a canonical tensor.
pub const TENSOR_LEN: usize = GRID_SIZE * GRID_SIZE;

/// Row-major 28×28 intensities in `[0, 1]`.
///
/// Produced by the normalization pipeline, where the maximum is exactly `1.0`
/// whenever ink was found and every value is zero otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTensor {
    values: Vec<f32>,
}

impl CanonicalTensor {
    /// The all-zero tensor (blank canvas).
    #[must_use]
    pub fn zeros() -> Self {
        Self {
            values: vec![0.0; TENSOR_LEN],
        }
    }

    /// Wrap 784 intensities.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` for the wrong length and `InvalidPixel`
    /// for a value that is not finite or lies outside `[0, 1]`.
    pub fn from_vec(values: Vec<f32>) -> Result<Self> {
        if values.len() != TENSOR_LEN {
            return Err(DigitError::dimension_mismatch(TENSOR_LEN, values.len()));
        }
        if let Some((index, &value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && (0.0..=1.0).contains(*v)))
        {
            return Err(DigitError::InvalidPixel { index, value });
        }
        Ok(Self { values })
    }

    /// Build from values the pipeline has already clamped and scaled.
    pub(crate) fn from_normalized(values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), TENSOR_LEN);
        Self { values }
    }

    /// Flat row-major view.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(row, col)`.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < GRID_SIZE && col < GRID_SIZE {
            Some(self.values[row * GRID_SIZE + col])
        } else {
            None
        }
    }

    /// Largest value in the tensor.
    #[must_use]
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// `true` when no ink made it into the tensor.
    ///
    /// Callers decide whether a blank canvas is worth a prediction.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    /// Consume into the flat vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }
}

impl Default for CanonicalTensor {
    fn default() -> Self {
        Self::zeros()
    }
}

impl AsRef<[f32]> for CanonicalTensor {
    fn as_ref(&self) -> &[f32] {
        &self.values
    }
}
