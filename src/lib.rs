//! # APR Digits
//!
//! Hand-drawn digit recognition on top of `aprender`: turn a stroke raster
//! into the 28×28 grid MNIST models expect, and keep one trained classifier
//! per process behind a single-flight cache.
//!
//! ## Components
//!
//! - **Normalization**: ink bounding box, padded square crop, area resample
//!   and peak scaling ([`normalize`])
//! - **Network**: the fixed two-block CNN and its layer shapes ([`network`])
//! - **Lifecycle**: load the persisted model or train one, exactly once
//!   ([`lifecycle`], [`trainer`])
//! - **Inference**: ten class scores per canvas ([`inference`])
//!
//! ```no_run
//! use apr_digits::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let cache = Arc::new(ModelCache::open(&config, "data/mnist")?);
//! let service = InferenceService::from_config(Arc::clone(&cache), &config)?;
//!
//! let canvas = Raster::blank(CANVAS_SIZE, CANVAS_SIZE);
//! let scores = service.predict_raster(&canvas)?;
//! let (digit, _) = scores.top();
//! println!("{digit}: {:?}", scores.percentages());
//! # Ok::<(), DigitError>(())
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod lifecycle;
pub mod network;
pub mod normalize;
pub mod raster;
pub mod runtime;
pub mod tensor;
pub mod trainer;

pub use error::{DigitError, Result};

/// Re-exports for convenient access
pub mod prelude {
    pub use crate::config::{Config, NormalizeConfig, StoreConfig, TrainingConfig};
    pub use crate::dataset::{DatasetSource, DatasetSplit, MnistData, SpriteDataset};
    pub use crate::error::{DigitError, Result};
    pub use crate::inference::{InferenceService, ScoreVector};
    pub use crate::lifecycle::{LifecycleState, ModelCache, ModelHandle, StatusHint};
    pub use crate::network::{digit_network, LayerDescriptor, NetworkSpec};
    pub use crate::normalize::{raster_to_tensor, Normalizer};
    pub use crate::raster::{Raster, CANVAS_SIZE};
    pub use crate::runtime::{AprenderRuntime, Examples, FitOptions, Runtime, StorageKey};
    pub use crate::tensor::CanonicalTensor;
    pub use crate::trainer::Trainer;
}
