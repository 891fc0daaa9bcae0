//! The fixed digit classifier architecture.
//!
//! ```text
//! Input: 1x28x28
//!     |
//! Conv2D: 16 filters, 3x3, ReLU   -> 16x26x26
//! MaxPool: 2x2, stride 2          -> 16x13x13
//! Conv2D: 32 filters, 3x3, ReLU   -> 32x11x11
//! MaxPool: 2x2, stride 2          -> 32x5x5
//! Flatten                         -> 800
//! Dense: 128, ReLU                -> 128
//! Dropout: 0.3                    -> 128
//! Dense: 10, Softmax              -> 10
//! ```
//!
//! Trainer, inference and the persisted store all depend on this exact
//! layout. Changing it requires bumping [`ARCHITECTURE_VERSION`], which is
//! part of the storage key.

use crate::error::{DigitError, Result};
use crate::tensor::GRID_SIZE;
use serde::Serialize;
use std::fmt;

/// Version segment of the persisted model key.
pub const ARCHITECTURE_VERSION: u32 = 2;

/// Number of output classes (digits 0-9).
pub const NUM_CLASSES: usize = 10;

/// Element-wise activation applied after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Activation {
    Relu,
    Softmax,
}

/// One layer of a sequential network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LayerSpec {
    /// Valid-padded, stride-1 convolution.
    Conv2d {
        filters: usize,
        kernel: usize,
        activation: Activation,
    },
    MaxPool2d {
        pool: usize,
        stride: usize,
    },
    Flatten,
    /// Fully connected layer.
    Dense {
        units: usize,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

/// Activation shape between layers, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Shape {
    /// Channels × height × width.
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spatial {
                channels,
                height,
                width,
            } => write!(f, "[batch, {channels}, {height}, {width}]"),
            Self::Flat(n) => write!(f, "[batch, {n}]"),
        }
    }
}

impl LayerSpec {
    /// Display name of the layer kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "Conv2D",
            Self::MaxPool2d { .. } => "MaxPooling2D",
            Self::Flatten => "Flatten",
            Self::Dense { .. } => "Dense",
            Self::Dropout { .. } => "Dropout",
        }
    }

    /// Shape this layer produces from `input`.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` when the layer cannot consume `input`.
    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        match (self, input) {
            (
                Self::Conv2d {
                    filters, kernel, ..
                },
                Shape::Spatial { height, width, .. },
            ) if *kernel >= 1 && height >= *kernel && width >= *kernel => Ok(Shape::Spatial {
                channels: *filters,
                height: height - kernel + 1,
                width: width - kernel + 1,
            }),
            (
                Self::MaxPool2d { pool, stride },
                Shape::Spatial {
                    channels,
                    height,
                    width,
                },
            ) if *pool >= 1 && *stride >= 1 && height >= *pool && width >= *pool => {
                Ok(Shape::Spatial {
                    channels,
                    height: (height - pool) / stride + 1,
                    width: (width - pool) / stride + 1,
                })
            }
            (
                Self::Flatten,
                Shape::Spatial {
                    channels,
                    height,
                    width,
                },
            ) => Ok(Shape::Flat(channels * height * width)),
            (Self::Flatten | Self::Dropout { .. }, Shape::Flat(n)) => Ok(Shape::Flat(n)),
            (Self::Dropout { .. }, spatial @ Shape::Spatial { .. }) => Ok(spatial),
            (Self::Dense { units, .. }, Shape::Flat(_)) => Ok(Shape::Flat(*units)),
            (layer, input) => Err(DigitError::dimension_mismatch(
                format!("input accepted by {}", layer.name()),
                input,
            )),
        }
    }
}

/// Read-only projection of one layer: name plus output shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub output_shape: String,
}

/// A sequential architecture with its input shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSpec {
    input: Shape,
    layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    /// Create a spec from an input shape and layer list.
    #[must_use]
    pub fn new(input: Shape, layers: Vec<LayerSpec>) -> Self {
        Self { input, layers }
    }

    /// Input shape, batch excluded.
    #[must_use]
    pub fn input(&self) -> Shape {
        self.input
    }

    /// Layers in execution order.
    #[must_use]
    pub fn layer_specs(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Output shape of every layer, in order.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` at the first layer that cannot consume
    /// its predecessor's output.
    pub fn shapes(&self) -> Result<Vec<Shape>> {
        let mut current = self.input;
        self.layers
            .iter()
            .map(|layer| {
                current = layer.output_shape(current)?;
                Ok(current)
            })
            .collect()
    }

    /// Layer name and output shape for every layer.
    ///
    /// # Errors
    ///
    /// Propagates shape inference failures.
    pub fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        Ok(self
            .layers
            .iter()
            .zip(self.shapes()?)
            .map(|(layer, shape)| LayerDescriptor {
                name: layer.name().to_string(),
                output_shape: shape.to_string(),
            })
            .collect())
    }

    /// BLAKE3 digest of the architecture, hex encoded.
    ///
    /// Two specs share a fingerprint exactly when they describe the same
    /// layers over the same input.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }
}

/// Loss minimized during fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Loss {
    CategoricalCrossEntropy,
}

/// Metric reported during fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Metric {
    Accuracy,
}

/// Optimizer, loss and metrics a network is compiled with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileOptions {
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Loss minimized by the fit loop and reported as `loss` / `val_loss`.
    pub loss: Loss,
    /// Metrics computed each epoch; ones left out are reported as NaN.
    pub metrics: Vec<Metric>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            loss: Loss::CategoricalCrossEntropy,
            metrics: vec![Metric::Accuracy],
        }
    }
}

impl CompileOptions {
    /// Set the learning rate.
    #[must_use]
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }
}

/// The digit classifier every model handle is built from.
#[must_use]
pub fn digit_network() -> NetworkSpec {
    NetworkSpec::new(
        Shape::Spatial {
            channels: 1,
            height: GRID_SIZE,
            width: GRID_SIZE,
        },
        vec![
            LayerSpec::Conv2d {
                filters: 16,
                kernel: 3,
                activation: Activation::Relu,
            },
            LayerSpec::MaxPool2d { pool: 2, stride: 2 },
            LayerSpec::Conv2d {
                filters: 32,
                kernel: 3,
                activation: Activation::Relu,
            },
            LayerSpec::MaxPool2d { pool: 2, stride: 2 },
            LayerSpec::Flatten,
            LayerSpec::Dense {
                units: 128,
                activation: Activation::Relu,
            },
            LayerSpec::Dropout { rate: 0.3 },
            LayerSpec::Dense {
                units: NUM_CLASSES,
                activation: Activation::Softmax,
            },
        ],
    )
}
