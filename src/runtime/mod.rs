//! Tensor runtime abstraction.
//!
//! The trainer, cache and inference service only talk to a [`Runtime`]. The
//! production implementation is [`AprenderRuntime`]; tests substitute a
//! lightweight fake.

mod apr;

pub use self::apr::{AprenderRuntime, CnnModel, StoredManifest};

use crate::config::TrainingConfig;
use crate::error::{DigitError, Result};
use crate::network::{CompileOptions, NetworkSpec, ARCHITECTURE_VERSION, NUM_CLASSES};
use crate::tensor::{CanonicalTensor, TENSOR_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Build, fit, run and persist networks.
///
/// Implementations must release every intermediate buffer they allocate
/// before returning, on success and on error alike.
pub trait Runtime: Send + Sync {
    /// A compiled, trainable network.
    type Model: Send + Sync + 'static;

    /// Instantiate `spec` with fresh weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the architecture cannot be realized.
    fn build(&self, spec: &NetworkSpec, options: &CompileOptions) -> Result<Self::Model>;

    /// Fit `model` on `train`, reporting metrics on `validation` each epoch.
    ///
    /// # Errors
    ///
    /// Returns `TrainingFailed` if fitting cannot complete.
    fn fit(
        &self,
        model: &mut Self::Model,
        train: &Examples,
        validation: &Examples,
        options: &FitOptions,
    ) -> Result<FitReport>;

    /// Class probabilities for one canonical tensor.
    ///
    /// # Errors
    ///
    /// Returns `InferenceFailed` if the forward pass fails.
    fn predict(&self, model: &Self::Model, input: &CanonicalTensor) -> Result<Vec<f32>>;

    /// Persist `model` under `key`, overwriting any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn save(&self, model: &Self::Model, spec: &NetworkSpec, key: &StorageKey) -> Result<()>;

    /// Load the model stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `PersistedLoadFailed` if nothing is stored, the entry is
    /// corrupt, or it was saved from a different architecture.
    fn load(&self, spec: &NetworkSpec, key: &StorageKey) -> Result<Self::Model>;
}

/// Labelled canonical images, stored flat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Examples {
    images: Vec<f32>,
    labels: Vec<u8>,
}

impl Examples {
    /// Wrap `labels.len()` row-major 28×28 images.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the buffers disagree on the number of
    /// examples, or `DatasetUnavailable` for a label outside `0..10`.
    pub fn new(images: Vec<f32>, labels: Vec<u8>) -> Result<Self> {
        let expected = labels.len() * TENSOR_LEN;
        if images.len() != expected {
            return Err(DigitError::dimension_mismatch(expected, images.len()));
        }
        if let Some(bad) = labels.iter().find(|&&l| usize::from(l) >= NUM_CLASSES) {
            return Err(DigitError::dataset_unavailable(format!(
                "label {bad} outside 0..{NUM_CLASSES}"
            )));
        }
        Ok(Self { images, labels })
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// `true` when there are no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pixels of example `index`.
    #[must_use]
    pub fn image(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(TENSOR_LEN)?;
        self.images.get(start..start + TENSOR_LEN)
    }

    /// Class index of example `index`.
    #[must_use]
    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.get(index).copied()
    }

    /// All labels.
    #[must_use]
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// All pixels, example after example.
    #[must_use]
    pub fn images(&self) -> &[f32] {
        &self.images
    }
}

/// Fit loop parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Reshuffle the training set every epoch.
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

impl From<&TrainingConfig> for FitOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            shuffle: true,
            seed: config.seed,
        }
    }
}

/// Metrics recorded at the end of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// One-based epoch number.
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

/// Per-epoch history of a fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub epochs: Vec<EpochMetrics>,
}

impl FitReport {
    /// Metrics of the last completed epoch.
    #[must_use]
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// Name of a persisted model slot.
///
/// Restricted to ASCII letters, digits, `.`, `_` and `-` so it can be used
/// directly as a file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    /// Validate and wrap `key`.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` for an empty key or one with other
    /// characters.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(key))
        } else {
            Err(DigitError::config(format!("invalid storage key {key:?}")))
        }
    }

    /// The key embedding the current architecture version.
    #[must_use]
    pub fn versioned() -> Self {
        Self(format!("digit-cnn-v{ARCHITECTURE_VERSION}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StorageKey {
    fn default() -> Self {
        Self::versioned()
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
