//! Runtime backed by aprender's autograd and neural network modules.
//!
//! Weights are persisted as SafeTensors next to a small JSON manifest that
//! records the architecture fingerprint, so a slot written by a different
//! layout is rejected instead of silently misloaded.

use super::{EpochMetrics, Examples, FitOptions, FitReport, Runtime, StorageKey};
use crate::error::{DigitError, Result};
use crate::network::{
    Activation, CompileOptions, LayerSpec, Loss, Metric, NetworkSpec, Shape, NUM_CLASSES,
};
use crate::tensor::{CanonicalTensor, GRID_SIZE, TENSOR_LEN};
use aprender::autograd::{self, Tensor};
use aprender::nn::loss::CrossEntropyLoss;
use aprender::nn::optim::{Adam, Optimizer};
use aprender::nn::{functional, serialize};
use aprender::nn::{Conv2d, Dropout, Flatten, Linear, MaxPool2d, Module, ReLU};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

type Layer = Box<dyn Module + Send + Sync>;

/// Clears the thread-local autograd tape when dropped.
///
/// Every batch and every prediction runs inside one of these, so the tape
/// is released even when a step bails out early.
struct TapeScope;

impl Drop for TapeScope {
    fn drop(&mut self) {
        autograd::clear_graph();
    }
}

/// A convolutional classifier realized from a [`NetworkSpec`].
pub struct CnnModel {
    layers: Vec<Layer>,
    /// Final layer outputs logits that still need a softmax.
    softmax_output: bool,
    options: CompileOptions,
}

impl std::fmt::Debug for CnnModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CnnModel")
            .field("layers", &self.layers.len())
            .field("softmax_output", &self.softmax_output)
            .field("options", &self.options)
            .finish()
    }
}

impl CnnModel {
    fn from_spec(spec: &NetworkSpec, options: &CompileOptions) -> Result<Self> {
        let shapes = spec.shapes()?;
        let specs = spec.layer_specs();
        let mut layers: Vec<Layer> = Vec::with_capacity(specs.len() * 2);
        let mut softmax_output = false;
        let mut input = spec.input();

        for (index, (layer, output)) in specs.iter().zip(shapes).enumerate() {
            let last = index + 1 == specs.len();
            match *layer {
                LayerSpec::Conv2d {
                    filters,
                    kernel,
                    activation,
                } => {
                    let Shape::Spatial { channels, .. } = input else {
                        return Err(DigitError::dimension_mismatch("spatial input", input));
                    };
                    layers.push(Box::new(Conv2d::new(channels, filters, kernel)));
                    softmax_output = push_activation(&mut layers, activation, last)?;
                }
                LayerSpec::MaxPool2d { pool, stride } => {
                    layers.push(Box::new(MaxPool2d::with_stride(pool, stride)));
                }
                LayerSpec::Flatten => layers.push(Box::new(Flatten::new())),
                LayerSpec::Dense { units, activation } => {
                    let Shape::Flat(features) = input else {
                        return Err(DigitError::dimension_mismatch("flat input", input));
                    };
                    layers.push(Box::new(Linear::new(features, units)));
                    softmax_output = push_activation(&mut layers, activation, last)?;
                }
                LayerSpec::Dropout { rate } => {
                    if !(0.0..1.0).contains(&rate) {
                        return Err(DigitError::config(format!(
                            "dropout rate must be in [0, 1), got {rate}"
                        )));
                    }
                    layers.push(Box::new(Dropout::new(rate)));
                }
            }
            input = output;
        }

        if input != Shape::Flat(NUM_CLASSES) {
            return Err(DigitError::dimension_mismatch(
                Shape::Flat(NUM_CLASSES),
                input,
            ));
        }

        Ok(Self {
            layers,
            softmax_output,
            options: options.clone(),
        })
    }

    /// Options the model was compiled with.
    #[must_use]
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    fn tracks(&self, metric: Metric) -> bool {
        self.options.metrics.contains(&metric)
    }

    /// Number of trainable scalars.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        serialize::count_parameters(self)
    }

    fn logits(&self, batch: &[f32], batch_len: usize) -> Tensor {
        let x = Tensor::new(batch, &[batch_len, 1, GRID_SIZE, GRID_SIZE]);
        self.forward(&x)
    }
}

/// Softmax is folded into the loss during training and applied explicitly
/// at prediction time, so it is only accepted on the output layer.
fn push_activation(layers: &mut Vec<Layer>, activation: Activation, last: bool) -> Result<bool> {
    match activation {
        Activation::Relu => {
            layers.push(Box::new(ReLU::new()));
            Ok(false)
        }
        Activation::Softmax if last => Ok(true),
        Activation::Softmax => Err(DigitError::config(
            "softmax is only supported on the output layer",
        )),
    }
}

impl Module for CnnModel {
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return input.clone();
        };
        layers.fold(first.forward(input), |x, layer| layer.forward(&x))
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }

    fn train(&mut self) {
        self.layers.iter_mut().for_each(|l| l.train());
    }

    fn eval(&mut self) {
        self.layers.iter_mut().for_each(|l| l.eval());
    }

    fn training(&self) -> bool {
        self.layers.iter().any(|l| l.training())
    }

    fn refresh_caches(&mut self) {
        self.layers.iter_mut().for_each(|l| l.refresh_caches());
    }
}

/// Sidecar written after the weights; its presence marks a complete slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredManifest {
    pub key: String,
    pub fingerprint: String,
    pub parameters: usize,
}

/// [`Runtime`] that trains on the CPU with aprender and stores models in a
/// directory.
#[derive(Debug, Clone)]
pub struct AprenderRuntime {
    directory: PathBuf,
}

impl AprenderRuntime {
    /// Store models under `directory`, created on first save.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Directory holding persisted models.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the weights file for `key`.
    #[must_use]
    pub fn weights_path(&self, key: &StorageKey) -> PathBuf {
        self.directory.join(format!("{key}.safetensors"))
    }

    /// Path of the manifest for `key`.
    #[must_use]
    pub fn manifest_path(&self, key: &StorageKey) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }

    /// Read the manifest stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `PersistedLoadFailed` if the manifest is missing or unreadable.
    pub fn manifest(&self, key: &StorageKey) -> Result<StoredManifest> {
        let path = self.manifest_path(key);
        let raw = fs::read_to_string(&path).map_err(|e| {
            DigitError::persisted_load_failed(format!("{}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| DigitError::persisted_load_failed(format!("{}: {e}", path.display())))
    }

    fn evaluate(model: &CnnModel, examples: &Examples, batch_size: usize) -> (f32, f32) {
        let loss_fn = loss_function(model.options.loss);
        let mut total_loss = 0.0_f64;
        let mut correct = 0_usize;

        autograd::no_grad(|| {
            for (batch, labels) in examples
                .images()
                .chunks(batch_size * TENSOR_LEN)
                .zip(examples.labels().chunks(batch_size))
            {
                let _tape = TapeScope;
                let logits = model.logits(batch, labels.len());
                let targets = class_targets(labels);
                total_loss += f64::from(loss_fn.forward(&logits, &targets).item())
                    * labels.len() as f64;
                correct += count_correct(logits.data(), labels);
            }
        });

        let n = examples.len().max(1);
        let accuracy = if model.tracks(Metric::Accuracy) {
            correct as f32 / n as f32
        } else {
            f32::NAN
        };
        ((total_loss / n as f64) as f32, accuracy)
    }
}

fn loss_function(loss: Loss) -> CrossEntropyLoss {
    match loss {
        Loss::CategoricalCrossEntropy => CrossEntropyLoss::new(),
    }
}

fn class_targets(labels: &[u8]) -> Tensor {
    let targets: Vec<f32> = labels.iter().map(|&l| f32::from(l)).collect();
    Tensor::new(&targets, &[labels.len()])
}

/// Rows of `logits` whose first maximum matches the label.
fn count_correct(logits: &[f32], labels: &[u8]) -> usize {
    logits
        .chunks(NUM_CLASSES)
        .zip(labels)
        .filter(|(row, &label)| argmax(row) == usize::from(label))
        .count()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}

impl Runtime for AprenderRuntime {
    type Model = CnnModel;

    fn build(&self, spec: &NetworkSpec, options: &CompileOptions) -> Result<CnnModel> {
        if !(options.learning_rate.is_finite() && options.learning_rate > 0.0) {
            return Err(DigitError::config(format!(
                "learning rate must be positive, got {}",
                options.learning_rate
            )));
        }
        let model = CnnModel::from_spec(spec, options)?;
        tracing::debug!(
            parameters = model.parameter_count(),
            learning_rate = options.learning_rate,
            "built network"
        );
        Ok(model)
    }

    fn fit(
        &self,
        model: &mut CnnModel,
        train: &Examples,
        validation: &Examples,
        options: &FitOptions,
    ) -> Result<FitReport> {
        if train.is_empty() {
            return Err(DigitError::training_failed("no training examples"));
        }
        if options.epochs == 0 || options.batch_size == 0 {
            return Err(DigitError::training_failed(
                "epochs and batch size must be positive",
            ));
        }

        let mut rng = options
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let loss_fn = loss_function(model.options.loss);
        let track_accuracy = model.tracks(Metric::Accuracy);
        let learning_rate = model.options.learning_rate;
        let mut optimizer = Adam::new(model.parameters_mut(), learning_rate);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut batch = Vec::with_capacity(options.batch_size * TENSOR_LEN);
        let mut report = FitReport::default();

        for epoch in 1..=options.epochs {
            model.train();
            if options.shuffle {
                order.shuffle(&mut rng);
            }

            let mut epoch_loss = 0.0_f64;
            let mut correct = 0_usize;

            for indices in order.chunks(options.batch_size) {
                let _tape = TapeScope;
                batch.clear();
                let mut labels = Vec::with_capacity(indices.len());
                for &i in indices {
                    if let (Some(image), Some(label)) = (train.image(i), train.label(i)) {
                        batch.extend_from_slice(image);
                        labels.push(label);
                    }
                }

                model.refresh_caches();
                optimizer.zero_grad();
                let logits = model.logits(&batch, labels.len());
                let loss = loss_fn.forward(&logits, &class_targets(&labels));
                let loss_value = loss.item();
                if !loss_value.is_finite() {
                    model.eval();
                    return Err(DigitError::training_failed(format!(
                        "loss diverged in epoch {epoch}"
                    )));
                }
                loss.backward();
                optimizer.step_with_params(&mut model.parameters_mut());

                epoch_loss += f64::from(loss_value) * labels.len() as f64;
                if track_accuracy {
                    correct += count_correct(logits.data(), &labels);
                }
            }

            model.eval();
            model.refresh_caches();
            let (val_loss, val_accuracy) = if validation.is_empty() {
                (f32::NAN, f32::NAN)
            } else {
                Self::evaluate(model, validation, options.batch_size)
            };

            let metrics = EpochMetrics {
                epoch,
                loss: (epoch_loss / train.len() as f64) as f32,
                accuracy: if track_accuracy {
                    correct as f32 / train.len() as f32
                } else {
                    f32::NAN
                },
                val_loss,
                val_accuracy,
            };
            tracing::info!(
                epoch,
                epochs = options.epochs,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                val_loss,
                val_accuracy,
                "epoch complete"
            );
            report.epochs.push(metrics);
        }

        Ok(report)
    }

    fn predict(&self, model: &CnnModel, input: &CanonicalTensor) -> Result<Vec<f32>> {
        let scores = autograd::no_grad(|| {
            let _tape = TapeScope;
            let logits = model.logits(input.as_slice(), 1);
            let output = if model.softmax_output {
                functional::softmax(&logits, -1)
            } else {
                logits
            };
            output.data().to_vec()
        });
        if scores.len() != NUM_CLASSES {
            return Err(DigitError::inference_failed(format!(
                "expected {NUM_CLASSES} outputs, got {}",
                scores.len()
            )));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(DigitError::inference_failed("non-finite score"));
        }
        Ok(scores)
    }

    fn save(&self, model: &CnnModel, spec: &NetworkSpec, key: &StorageKey) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        let weights = self.weights_path(key);
        serialize::save_model(model, &weights).map_err(DigitError::Aprender)?;

        let manifest = StoredManifest {
            key: key.to_string(),
            fingerprint: spec.fingerprint(),
            parameters: model.parameter_count(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| DigitError::Aprender(e.to_string()))?;
        fs::write(self.manifest_path(key), json)?;

        tracing::info!(
            key = %key,
            path = %weights.display(),
            parameters = manifest.parameters,
            "saved model"
        );
        Ok(())
    }

    fn load(&self, spec: &NetworkSpec, key: &StorageKey) -> Result<CnnModel> {
        let manifest = self.manifest(key)?;
        if manifest.fingerprint != spec.fingerprint() {
            return Err(DigitError::persisted_load_failed(format!(
                "{key} was saved from a different architecture"
            )));
        }

        let mut model = CnnModel::from_spec(spec, &CompileOptions::default())
            .map_err(|e| DigitError::persisted_load_failed(e.to_string()))?;
        serialize::load_model(&mut model, self.weights_path(key))
            .map_err(DigitError::persisted_load_failed)?;
        if model.parameter_count() != manifest.parameters {
            return Err(DigitError::persisted_load_failed(format!(
                "{key} holds {} parameters, manifest says {}",
                model.parameter_count(),
                manifest.parameters
            )));
        }
        model.eval();
        model.refresh_caches();

        tracing::debug!(key = %key, "loaded persisted model");
        Ok(model)
    }
}
