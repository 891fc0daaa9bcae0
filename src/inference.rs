//! Prediction over the cached model.

use crate::config::Config;
use crate::dataset::DatasetSource;
use crate::error::{DigitError, Result};
use crate::lifecycle::ModelCache;
use crate::network::NUM_CLASSES;
use crate::normalize::Normalizer;
use crate::raster::Raster;
use crate::runtime::Runtime;
use crate::tensor::CanonicalTensor;
use std::sync::Arc;

/// Ten class scores, one per digit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector {
    scores: Vec<f32>,
}

impl ScoreVector {
    /// Wrap runtime output.
    ///
    /// # Errors
    ///
    /// Returns `InferenceFailed` unless there are exactly ten scores.
    pub fn new(scores: Vec<f32>) -> Result<Self> {
        if scores.len() != NUM_CLASSES {
            return Err(DigitError::inference_failed(format!(
                "expected {NUM_CLASSES} scores, got {}",
                scores.len()
            )));
        }
        Ok(Self { scores })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.scores
    }

    /// Score for `digit`, if it is in `0..10`.
    #[must_use]
    pub fn get(&self, digit: usize) -> Option<f32> {
        self.scores.get(digit).copied()
    }

    /// Most likely digit and its share of the total, in percent.
    ///
    /// Ties go to the smaller digit.
    #[must_use]
    pub fn top(&self) -> (usize, f32) {
        self.percentages()
            .into_iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (digit, percent)| {
                if percent > best.1 {
                    (digit, percent)
                } else {
                    best
                }
            })
    }

    /// Scores rescaled to percentages of their sum.
    ///
    /// An all-zero vector stays all zero.
    #[must_use]
    pub fn percentages(&self) -> Vec<f32> {
        let total: f32 = self.scores.iter().sum();
        let total = if total == 0.0 { 1.0 } else { total };
        self.scores.iter().map(|s| s / total * 100.0).collect()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.scores
    }
}

/// Runs canonical tensors through the process-wide model.
#[derive(Debug)]
pub struct InferenceService<R: Runtime, D: DatasetSource> {
    cache: Arc<ModelCache<R, D>>,
    normalizer: Normalizer,
}

impl<R: Runtime, D: DatasetSource> InferenceService<R, D> {
    /// Predict with the model held by `cache`.
    #[must_use]
    pub fn new(cache: Arc<ModelCache<R, D>>) -> Self {
        Self {
            cache,
            normalizer: Normalizer::default(),
        }
    }

    /// Predict with the model held by `cache`, normalizing rasters with the
    /// `[normalize]` section of `config`.
    ///
    /// # Errors
    ///
    /// Returns `DigitError::Config` if the normalization settings are invalid.
    pub fn from_config(cache: Arc<ModelCache<R, D>>, config: &Config) -> Result<Self> {
        Ok(Self::new(cache).with_normalizer(Normalizer::new(config.normalize)?))
    }

    /// Use `normalizer` for [`InferenceService::predict_raster`].
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ModelCache<R, D>> {
        &self.cache
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Class scores for `input`, resolving the model first if needed.
    ///
    /// A failing forward pass does not affect the cache state.
    ///
    /// # Errors
    ///
    /// Returns the cache's resolution error, or `InferenceFailed` if the
    /// forward pass fails or yields the wrong number of scores.
    pub fn predict(&self, input: &CanonicalTensor) -> Result<ScoreVector> {
        let handle = self.cache.load(None)?;
        let scores = self
            .cache
            .runtime()
            .predict(handle.model(), input)
            .map_err(|err| match err {
                DigitError::InferenceFailed { .. } => err,
                other => DigitError::inference_failed(other.to_string()),
            })?;
        let scores = ScoreVector::new(scores)?;
        let (digit, percent) = scores.top();
        tracing::debug!(digit, percent, "predicted");
        Ok(scores)
    }

    /// Normalize `raster` and predict.
    ///
    /// # Errors
    ///
    /// Same as [`InferenceService::predict`].
    pub fn predict_raster(&self, raster: &Raster) -> Result<ScoreVector> {
        self.predict(&self.normalizer.normalize(raster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: [f32; NUM_CLASSES]) -> ScoreVector {
        ScoreVector::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_rejects_wrong_length() {
        let err = ScoreVector::new(vec![0.1; 9]).unwrap_err();
        assert!(matches!(err, DigitError::InferenceFailed { .. }));
    }

    #[test]
    fn test_top_prefers_first_maximum() {
        let v = scores([0.0, 0.4, 0.1, 0.4, 0.0, 0.0, 0.1, 0.0, 0.0, 0.0]);
        let (digit, percent) = v.top();
        assert_eq!(digit, 1);
        assert!((percent - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_percentages() {
        let v = scores([1.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let pct = v.percentages();
        assert!((pct[0] - 25.0).abs() < 1e-4);
        assert!((pct[1] - 75.0).abs() < 1e-4);
        assert_eq!(pct[2], 0.0);
    }

    #[test]
    fn test_percentages_of_zero_vector() {
        let v = scores([0.0; NUM_CLASSES]);
        assert!(v.percentages().iter().all(|&p| p == 0.0));
        assert_eq!(v.get(9), Some(0.0));
        assert_eq!(v.get(10), None);
    }
}
