//! Learned correction of the forecast
//!
//! - Feature engineering and standardization
//! - Ridge regression training with regularization search
//! - A gradient-descent linear model used by the hyperparameter sweep
//! - The prediction strategy chain (learned model, hourly profile, fallback)
//!
//! # Architecture
//! Everything here is synchronous and pure; the forecast engine owns the
//! committed model snapshot and decides when to train.

use serde::{Deserialize, Serialize};

pub mod features;
pub mod models;
pub mod scaler;
pub mod strategies;
pub mod training;

pub use features::*;
pub use models::*;
pub use scaler::*;
pub use strategies::*;
pub use training::*;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeatureError {
    #[error("Feature count mismatch: {values} values, {names} names")]
    CountMismatch { values: usize, names: usize },
    #[error("Feature '{0}' missing")]
    Missing(String),
}

/// Named feature values in a fixed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: Vec<f64>,
    pub feature_names: Vec<String>,
}

impl FeatureVector {
    pub fn new(features: Vec<f64>, feature_names: Vec<String>) -> Result<Self, FeatureError> {
        if features.len() != feature_names.len() {
            return Err(FeatureError::CountMismatch {
                values: features.len(),
                names: feature_names.len(),
            });
        }
        Ok(Self {
            features,
            feature_names,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// One value per name. The fields are public, so a vector built by hand
    /// may not hold this.
    pub fn is_consistent(&self) -> bool {
        self.features.len() == self.feature_names.len()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.feature_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.features.get(i).copied())
    }

    /// Values reordered to `names`; fails if any name is absent
    pub fn values_in_order(&self, names: &[String]) -> Result<Vec<f64>, FeatureError> {
        if !self.is_consistent() {
            return Err(FeatureError::CountMismatch {
                values: self.features.len(),
                names: self.feature_names.len(),
            });
        }
        if self.feature_names.as_slice() == names {
            return Ok(self.features.clone());
        }
        names
            .iter()
            .map(|name| self.get(name).ok_or_else(|| FeatureError::Missing(name.clone())))
            .collect()
    }
}

/// Fit quality of a model on a set of targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

impl ValidationMetrics {
    /// Returns `None` for empty or mismatched inputs
    pub fn calculate(predictions: &[f64], targets: &[f64]) -> Option<Self> {
        if predictions.len() != targets.len() || predictions.is_empty() {
            return None;
        }

        let n = predictions.len() as f64;
        let mae = predictions
            .iter()
            .zip(targets)
            .map(|(p, t)| (p - t).abs())
            .sum::<f64>()
            / n;
        let mse = predictions
            .iter()
            .zip(targets)
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>()
            / n;

        let mean_target = targets.iter().sum::<f64>() / n;
        let ss_tot: f64 = targets.iter().map(|t| (t - mean_target).powi(2)).sum();
        let ss_res: f64 = predictions
            .iter()
            .zip(targets)
            .map(|(p, t)| (t - p).powi(2))
            .sum();
        let r2 = if ss_tot.abs() < 1e-10 {
            0.0
        } else {
            1.0 - ss_res / ss_tot
        };

        Some(Self {
            mae,
            rmse: mse.sqrt(),
            r2,
        })
    }

    /// R² clamped to [0, 1], the form stored as model accuracy
    pub fn accuracy(&self) -> f64 {
        if self.r2.is_finite() {
            self.r2.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
