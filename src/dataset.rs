//! MNIST training data.
//!
//! The bundled dataset is a sprite sheet: a PNG 784 pixels wide with one
//! flattened 28×28 digit per row, plus a blob of one-hot `u8` labels, ten
//! bytes per image.

use crate::error::{DigitError, Result};
use crate::network::NUM_CLASSES;
use crate::runtime::Examples;
use crate::tensor::TENSOR_LEN;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the image sprite inside a dataset directory.
pub const SPRITE_FILE: &str = "mnist_images.png";

/// File name of the one-hot label blob inside a dataset directory.
pub const LABELS_FILE: &str = "mnist_labels_uint8";

/// Supplies the raw train and test splits.
pub trait DatasetSource: Send + Sync {
    /// Fetch both splits.
    ///
    /// # Errors
    ///
    /// Returns `DatasetUnavailable` when the data cannot be retrieved.
    fn load(&self) -> Result<MnistData>;
}

/// Flat image buffers (`N × 784`, values in `[0, 1]`) and one-hot label
/// buffers (`N × 10`) for both splits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MnistData {
    pub train_images: Vec<f32>,
    pub train_labels: Vec<u8>,
    pub test_images: Vec<f32>,
    pub test_labels: Vec<u8>,
}

impl MnistData {
    /// Number of training examples implied by the label buffer.
    #[must_use]
    pub fn train_len(&self) -> usize {
        self.train_labels.len() / NUM_CLASSES
    }

    /// Number of test examples implied by the label buffer.
    #[must_use]
    pub fn test_len(&self) -> usize {
        self.test_labels.len() / NUM_CLASSES
    }

    /// Check both splits and convert them to class-indexed examples.
    ///
    /// # Errors
    ///
    /// Returns `TrainingFailed` if any buffer has the wrong length or a label
    /// row is not one-hot.
    pub fn into_examples(self) -> Result<(Examples, Examples)> {
        let train = split_examples("train", self.train_images, &self.train_labels)?;
        let test = split_examples("test", self.test_images, &self.test_labels)?;
        Ok((train, test))
    }
}

fn split_examples(name: &str, images: Vec<f32>, one_hot: &[u8]) -> Result<Examples> {
    if one_hot.len() % NUM_CLASSES != 0 {
        return Err(DigitError::training_failed(format!(
            "{name} labels hold {} bytes, not a multiple of {NUM_CLASSES}",
            one_hot.len()
        )));
    }
    let count = one_hot.len() / NUM_CLASSES;
    if images.len() != count * TENSOR_LEN {
        return Err(DigitError::training_failed(format!(
            "{name} split has {} pixels for {count} labels",
            images.len()
        )));
    }
    let labels = one_hot
        .chunks(NUM_CLASSES)
        .enumerate()
        .map(|(row, hot)| {
            decode_one_hot(hot).ok_or_else(|| {
                DigitError::training_failed(format!("{name} label {row} is not one-hot"))
            })
        })
        .collect::<Result<Vec<u8>>>()?;
    Examples::new(images, labels).map_err(DigitError::into_training_failure)
}

/// Class index of the single hot byte in `row`.
fn decode_one_hot(row: &[u8]) -> Option<u8> {
    let mut hot = row.iter().enumerate().filter(|(_, &b)| b != 0);
    let (index, _) = hot.next()?;
    if hot.next().is_some() {
        return None;
    }
    u8::try_from(index).ok()
}

/// Where the train split ends inside the sprite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSplit {
    /// Images in the sprite.
    pub total: usize,
    /// The first `train` rows form the train split, the rest the test split.
    pub train: usize,
}

impl Default for DatasetSplit {
    fn default() -> Self {
        Self {
            total: 65_000,
            train: 55_000,
        }
    }
}

/// Reads the MNIST sprite and label blob from a local directory.
#[derive(Debug, Clone)]
pub struct SpriteDataset {
    directory: PathBuf,
    split: DatasetSplit,
}

impl SpriteDataset {
    /// Read `mnist_images.png` and `mnist_labels_uint8` from `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            split: DatasetSplit::default(),
        }
    }

    /// Use a custom split, e.g. for a reduced fixture.
    #[must_use]
    pub fn with_split(mut self, split: DatasetSplit) -> Self {
        self.split = split;
        self
    }

    /// Dataset directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn read_sprite(&self) -> Result<Vec<f32>> {
        let path = self.directory.join(SPRITE_FILE);
        let sprite = image::open(&path)
            .map_err(|e| DigitError::dataset_unavailable(format!("{}: {e}", path.display())))?
            .to_rgba8();

        if sprite.width() as usize != TENSOR_LEN {
            return Err(DigitError::dataset_unavailable(format!(
                "sprite is {} pixels wide, expected {TENSOR_LEN}",
                sprite.width()
            )));
        }
        if (sprite.height() as usize) < self.split.total {
            return Err(DigitError::dataset_unavailable(format!(
                "sprite holds {} images, expected {}",
                sprite.height(),
                self.split.total
            )));
        }

        Ok(sprite
            .pixels()
            .take(self.split.total * TENSOR_LEN)
            .map(|p| f32::from(p[0]) / 255.0)
            .collect())
    }

    fn read_labels(&self) -> Result<Vec<u8>> {
        let path = self.directory.join(LABELS_FILE);
        let mut labels = fs::read(&path)
            .map_err(|e| DigitError::dataset_unavailable(format!("{}: {e}", path.display())))?;
        let expected = self.split.total * NUM_CLASSES;
        if labels.len() < expected {
            return Err(DigitError::dataset_unavailable(format!(
                "label blob holds {} bytes, expected {expected}",
                labels.len()
            )));
        }
        labels.truncate(expected);
        Ok(labels)
    }
}

impl DatasetSource for SpriteDataset {
    fn load(&self) -> Result<MnistData> {
        if self.split.train > self.split.total {
            return Err(DigitError::dataset_unavailable(format!(
                "train split {} exceeds total {}",
                self.split.train, self.split.total
            )));
        }

        let mut train_images = self.read_sprite()?;
        let mut train_labels = self.read_labels()?;
        let test_images = train_images.split_off(self.split.train * TENSOR_LEN);
        let test_labels = train_labels.split_off(self.split.train * NUM_CLASSES);

        tracing::info!(
            directory = %self.directory.display(),
            train = self.split.train,
            test = self.split.total - self.split.train,
            "loaded dataset"
        );
        Ok(MnistData {
            train_images,
            train_labels,
            test_images,
            test_labels,
        })
    }
}

impl DatasetSource for MnistData {
    fn load(&self) -> Result<MnistData> {
        Ok(self.clone())
    }
}
