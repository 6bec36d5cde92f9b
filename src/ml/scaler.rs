//! Z-score standardization of feature vectors

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::{FeatureError, FeatureVector};

/// Standard deviations at or below this are treated as constant features
pub const MIN_STD: f64 = 1e-8;

/// Persisted fit statistics; stored together with the weights they belong to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl ScalerState {
    pub fn is_fitted(&self) -> bool {
        !self.feature_names.is_empty()
            && self.means.len() == self.feature_names.len()
            && self.stds.len() == self.feature_names.len()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScalerError {
    #[error("Cannot fit scaler on an empty sample set")]
    Empty,
    #[error("Inconsistent feature layout in training samples")]
    InconsistentLayout,
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

/// Output of [`FeatureScaler::transform`]
#[derive(Debug, Clone, PartialEq)]
pub struct Scaled {
    pub vector: FeatureVector,
    /// True when the scaler was never fit and values passed through unchanged
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureScaler {
    state: ScalerState,
}

impl FeatureScaler {
    pub fn from_state(state: ScalerState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ScalerState {
        &self.state
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_fitted()
    }

    pub fn fit(&mut self, samples: &[FeatureVector]) -> Result<(), ScalerError> {
        let first = samples.first().ok_or(ScalerError::Empty)?;
        let names = first.feature_names.clone();
        if samples.iter().any(|s| s.feature_names != names || !s.is_consistent()) {
            return Err(ScalerError::InconsistentLayout);
        }

        let mut means = Vec::with_capacity(names.len());
        let mut stds = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            let column: Vec<f64> = samples.iter().filter_map(|s| s.features.get(i).copied()).collect();
            means.push(column.iter().mean());
            let std = column.iter().population_std_dev();
            stds.push(if std.is_finite() && std > MIN_STD { std } else { 1.0 });
        }

        self.state = ScalerState {
            feature_names: names,
            means,
            stds,
        };
        Ok(())
    }

    /// Standardize using the fit-time order and statistics. An unfitted
    /// scaler passes values through and flags the result as degraded.
    pub fn transform(&self, vector: &FeatureVector) -> Result<Scaled, ScalerError> {
        if !self.is_fitted() {
            return Ok(Scaled {
                vector: vector.clone(),
                degraded: true,
            });
        }

        let values = vector.values_in_order(&self.state.feature_names)?;
        let features = values
            .iter()
            .zip(self.state.means.iter().zip(&self.state.stds))
            .map(|(v, (mean, std))| (v - mean) / std)
            .collect();

        Ok(Scaled {
            vector: FeatureVector {
                features,
                feature_names: self.state.feature_names.clone(),
            },
            degraded: false,
        })
    }

    pub fn fit_transform(&mut self, samples: &[FeatureVector]) -> Result<Vec<FeatureVector>, ScalerError> {
        self.fit(samples)?;
        samples
            .iter()
            .map(|s| self.transform(s).map(|scaled| scaled.vector))
            .collect()
    }
}
