//! Configuration via TOML files.
//!
//! Every section and key is optional; anything missing falls back to the
//! values the training recipe was designed around. The canonical grid size
//! and the network architecture are not configurable.
//!
//! ```toml
//! [normalize]
//! ink_threshold = 10
//! padding = 20
//!
//! [training]
//! epochs = 5
//! batch_size = 128
//! seed = 7
//!
//! [store]
//! directory = "models"
//! ```

use crate::error::{DigitError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stroke normalization settings.
    pub normalize: NormalizeConfig,
    /// Training recipe.
    pub training: TrainingConfig,
    /// Model store location.
    pub store: StoreConfig,
}

/// Settings for the crop and resample stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// A pixel is ink when its sampled channel is strictly above this value.
    pub ink_threshold: u8,
    /// Margin added on every side of the ink bounding box, in pixels.
    pub padding: u32,
    /// RGBA channel sampled for ink (0 = red).
    pub channel: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            ink_threshold: 10,
            padding: 20,
            channel: 0,
        }
    }
}

impl NormalizeConfig {
    /// Set the ink threshold.
    #[must_use]
    pub fn with_ink_threshold(mut self, threshold: u8) -> Self {
        self.ink_threshold = threshold;
        self
    }

    /// Set the padding.
    #[must_use]
    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Check that `channel` names an RGBA channel.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` for a channel outside `0..=3`.
    pub fn validate(&self) -> Result<()> {
        if self.channel > 3 {
            return Err(DigitError::config(format!(
                "normalize.channel must be in 0..=3, got {}",
                self.channel
            )));
        }
        Ok(())
    }
}

/// Training recipe.
///
/// The defaults train on a random 8000-example subset for five epochs, which
/// keeps in-process training time bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training examples drawn from the train split.
    pub train_subset: usize,
    /// Number of validation examples drawn from the test split.
    pub test_subset: usize,
    /// Passes over the training subset.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Seed for subset selection and shuffling; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_subset: 8000,
            test_subset: 1000,
            epochs: 5,
            batch_size: 128,
            learning_rate: 0.001,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Set the subset sizes.
    #[must_use]
    pub fn with_subsets(mut self, train: usize, test: usize) -> Self {
        self.train_subset = train;
        self.test_subset = test;
        self
    }

    /// Set the number of epochs.
    #[must_use]
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the mini-batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Fix the RNG seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(DigitError::config("training.epochs must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DigitError::config("training.batch_size must be positive"));
        }
        if self.train_subset == 0 || self.test_subset == 0 {
            return Err(DigitError::config("training subsets must be non-empty"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DigitError::config(format!(
                "training.learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Where trained weights are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the model slot.
    pub directory: PathBuf,
    /// Override for the versioned storage key.
    pub key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("models"),
            key: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or invalid values.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| DigitError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.normalize.validate()?;
        self.training.validate()
    }
}
