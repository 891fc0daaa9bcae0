//! Fresh-model training.
//!
//! Fetches the dataset, draws random subsets, fits the digit network and
//! persists it. Every failure on the way is reported as `TrainingFailed`
//! with the underlying cause in the message.

use crate::config::TrainingConfig;
use crate::dataset::DatasetSource;
use crate::error::{DigitError, Result};
use crate::lifecycle::ModelHandle;
use crate::network::{digit_network, CompileOptions};
use crate::runtime::{Examples, FitOptions, Runtime, StorageKey};
use crate::tensor::TENSOR_LEN;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;

/// Trains the digit network and saves it under a storage key.
#[derive(Debug)]
pub struct Trainer<R, D> {
    runtime: Arc<R>,
    dataset: Arc<D>,
    config: TrainingConfig,
    key: StorageKey,
}

impl<R: Runtime, D: DatasetSource> Trainer<R, D> {
    /// Create a trainer saving under the versioned default key.
    #[must_use]
    pub fn new(runtime: Arc<R>, dataset: Arc<D>, config: TrainingConfig) -> Self {
        Self {
            runtime,
            dataset,
            config,
            key: StorageKey::default(),
        }
    }

    /// Save under `key` instead of the default.
    #[must_use]
    pub fn with_key(mut self, key: StorageKey) -> Self {
        self.key = key;
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    #[must_use]
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train, persist and return a new model.
    ///
    /// Nothing is saved unless fitting completes.
    ///
    /// # Errors
    ///
    /// Returns `TrainingFailed` if the dataset is unavailable or malformed,
    /// or if build, fit or save fail.
    pub fn train(&self) -> Result<ModelHandle<R::Model>> {
        let started = Instant::now();
        let data = self
            .dataset
            .load()
            .map_err(DigitError::into_training_failure)?;
        let (train_split, test_split) = data.into_examples()?;

        let mut rng = self
            .config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let train = draw_subset(&train_split, self.config.train_subset, &mut rng)?;
        let validation = draw_subset(&test_split, self.config.test_subset, &mut rng)?;
        drop((train_split, test_split));
        if train.is_empty() {
            return Err(DigitError::training_failed("training split is empty"));
        }

        tracing::info!(
            train = train.len(),
            validation = validation.len(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            "training digit network"
        );

        let spec = digit_network();
        let options = CompileOptions::default().with_learning_rate(self.config.learning_rate);
        let mut model = self
            .runtime
            .build(&spec, &options)
            .map_err(DigitError::into_training_failure)?;

        let fit_options = FitOptions {
            seed: self.config.seed.map(|_| rng.gen()),
            ..FitOptions::from(&self.config)
        };
        let report = self
            .runtime
            .fit(&mut model, &train, &validation, &fit_options)
            .map_err(DigitError::into_training_failure)?;

        self.runtime
            .save(&model, &spec, &self.key)
            .map_err(DigitError::into_training_failure)?;

        tracing::info!(
            key = %self.key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            val_accuracy = report.last().map_or(f32::NAN, |m| m.val_accuracy),
            "training complete"
        );
        Ok(ModelHandle::new(spec, model).with_report(report))
    }
}

/// Up to `amount` examples drawn without replacement, in random order.
fn draw_subset(examples: &Examples, amount: usize, rng: &mut StdRng) -> Result<Examples> {
    let amount = amount.min(examples.len());
    let indices = rand::seq::index::sample(rng, examples.len(), amount);
    let mut images = Vec::with_capacity(amount * TENSOR_LEN);
    let mut labels = Vec::with_capacity(amount);
    for i in indices.iter() {
        if let (Some(image), Some(label)) = (examples.image(i), examples.label(i)) {
            images.extend_from_slice(image);
            labels.push(label);
        }
    }
    Examples::new(images, labels).map_err(DigitError::into_training_failure)
}
