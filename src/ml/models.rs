//! Model state shared between training and prediction

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

use super::scaler::ScalerState;
use super::FeatureVector;
use crate::domain::TrainingRecord;

pub const CORRECTION_FACTOR_MIN: f64 = 0.5;
pub const CORRECTION_FACTOR_MAX: f64 = 1.5;

/// Samples at which a profile reaches full confidence
pub const PROFILE_FULL_CONFIDENCE_SAMPLES: f64 = 300.0;

/// Readiness of the learned model
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    #[default]
    Uninitialized,
    Training,
    Ready,
    /// Model exists but is weak or stale
    Degraded,
    /// Numeric backend unavailable; only the fallback strategy runs
    Error,
}

impl ModelState {
    /// State after a failed or cancelled training run
    pub fn after_failed_training(had_model: bool) -> Self {
        if had_model {
            Self::Ready
        } else {
            Self::Uninitialized
        }
    }

    pub fn has_model(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

/// Persisted model health
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelStatus {
    pub state: ModelState,
    pub accuracy: Option<f64>,
    pub training_samples: usize,
    pub last_trained: Option<DateTime<Utc>>,
    pub last_training_duration_secs: Option<f64>,
    pub numeric_backend_available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Committed ridge model with the scaler it was trained against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedWeights {
    pub weights: BTreeMap<String, f64>,
    pub bias: f64,
    /// Order in which weights are applied; must match `scaler.feature_names`
    pub feature_names: Vec<String>,
    pub scaler: ScalerState,
    /// R² in [0, 1]
    pub accuracy: Option<f64>,
    pub training_samples: usize,
    pub last_trained: Option<DateTime<Utc>>,
    pub lambda: Option<f64>,
    pub correction_factor: f64,
}

impl Default for LearnedWeights {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            bias: 0.0,
            feature_names: Vec::new(),
            scaler: ScalerState::default(),
            accuracy: None,
            training_samples: 0,
            last_trained: None,
            lambda: None,
            correction_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeightsError {
    #[error("No weight for feature '{0}'")]
    MissingWeight(String),
    #[error("Input lacks feature '{0}'")]
    MissingFeature(String),
    #[error("Prediction is not finite")]
    NonFinite,
}

impl LearnedWeights {
    pub fn is_trained(&self) -> bool {
        !self.feature_names.is_empty() && self.last_trained.is_some()
    }

    /// bias + Σ wᵢ·xᵢ over `feature_names`, in that order
    pub fn predict(&self, features: &FeatureVector) -> Result<f64, WeightsError> {
        let mut value = self.bias;
        for name in &self.feature_names {
            let weight = self
                .weights
                .get(name)
                .ok_or_else(|| WeightsError::MissingWeight(name.clone()))?;
            let x = features
                .get(name)
                .ok_or_else(|| WeightsError::MissingFeature(name.clone()))?;
            value += weight * x;
        }
        if value.is_finite() {
            Ok(value)
        } else {
            Err(WeightsError::NonFinite)
        }
    }

    pub fn set_correction_factor(&mut self, factor: f64) {
        self.correction_factor = if factor.is_finite() {
            factor.clamp(CORRECTION_FACTOR_MIN, CORRECTION_FACTOR_MAX)
        } else {
            1.0
        };
    }

    pub fn weight_norm(&self) -> f64 {
        self.weights.values().map(|w| w * w).sum::<f64>().sqrt()
    }
}

/// Median production per local hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyProfile {
    pub hourly_medians: [f64; 24],
    pub samples_count: usize,
    pub confidence: f64,
    pub built_at: Option<DateTime<Utc>>,
}

impl Default for HourlyProfile {
    fn default() -> Self {
        Self {
            hourly_medians: [0.0; 24],
            samples_count: 0,
            confidence: 0.0,
            built_at: None,
        }
    }
}

impl HourlyProfile {
    /// Rebuild from records; only hours with positive production count
    pub fn from_records(records: &[TrainingRecord]) -> Self {
        let mut by_hour: [Vec<f64>; 24] = Default::default();
        for record in records.iter().filter(|r| r.is_usable() && r.actual_kwh > 0.0) {
            by_hour[record.timestamp.hour() as usize].push(record.actual_kwh);
        }

        let samples_count = by_hour.iter().map(Vec::len).sum();
        let mut hourly_medians = [0.0; 24];
        for (hour, values) in by_hour.into_iter().enumerate() {
            if !values.is_empty() {
                hourly_medians[hour] = Data::new(values).median();
            }
        }

        Self {
            hourly_medians,
            samples_count,
            confidence: (samples_count as f64 / PROFILE_FULL_CONFIDENCE_SAMPLES).clamp(0.1, 1.0),
            built_at: Some(Utc::now()),
        }
    }

    pub fn median_for(&self, hour: u32) -> f64 {
        self.hourly_medians.get(hour as usize).copied().unwrap_or(0.0)
    }
}

/// Plain linear model produced by gradient descent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressionModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearRegressionModel {
    pub fn new(coefficients: Vec<f64>, intercept: f64) -> Self {
        Self {
            coefficients,
            intercept,
        }
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        features
            .iter()
            .zip(&self.coefficients)
            .map(|(f, c)| f * c)
            .sum::<f64>()
            + self.intercept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn record(hour: u32, kwh: f64) -> TrainingRecord {
        TrainingRecord {
            timestamp: FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2024, 5, 10, hour, 0, 0)
                .unwrap(),
            actual_kwh: kwh,
            weather: Default::default(),
            sensor: Default::default(),
        }
    }

    fn trained(weights: &[(&str, f64)], bias: f64) -> LearnedWeights {
        LearnedWeights {
            weights: weights.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
            bias,
            feature_names: weights.iter().map(|(n, _)| n.to_string()).collect(),
            last_trained: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_predict_applies_weights_by_name() {
        let model = trained(&[("a", 2.0), ("b", -1.0)], 0.5);
        let features = FeatureVector::new(vec![4.0, 3.0], vec!["b".into(), "a".into()]).unwrap();
        assert_eq!(model.predict(&features).unwrap(), 0.5 + 2.0 * 3.0 - 4.0);
    }

    #[test]
    fn test_predict_reports_missing_feature() {
        let model = trained(&[("a", 1.0)], 0.0);
        let features = FeatureVector::new(vec![1.0], vec!["z".into()]).unwrap();
        assert_eq!(
            model.predict(&features),
            Err(WeightsError::MissingFeature("a".into()))
        );
    }

    #[test]
    fn test_correction_factor_clamped() {
        let mut weights = LearnedWeights::default();
        weights.set_correction_factor(3.0);
        assert_eq!(weights.correction_factor, CORRECTION_FACTOR_MAX);
        weights.set_correction_factor(0.1);
        assert_eq!(weights.correction_factor, CORRECTION_FACTOR_MIN);
        weights.set_correction_factor(f64::NAN);
        assert_eq!(weights.correction_factor, 1.0);
    }

    #[test]
    fn test_profile_medians_and_confidence() {
        let records = vec![
            record(12, 2.0),
            record(12, 4.0),
            record(12, 3.0),
            record(13, 1.0),
            record(2, 0.0),
        ];
        let profile = HourlyProfile::from_records(&records);
        assert_eq!(profile.median_for(12), 3.0);
        assert_eq!(profile.median_for(13), 1.0);
        assert_eq!(profile.median_for(2), 0.0);
        assert_eq!(profile.samples_count, 4);
        assert_eq!(profile.confidence, 0.1);
        assert_eq!(profile.median_for(30), 0.0);
    }

    #[test]
    fn test_failed_training_state() {
        assert_eq!(ModelState::after_failed_training(true), ModelState::Ready);
        assert_eq!(ModelState::after_failed_training(false), ModelState::Uninitialized);
        assert_eq!(ModelState::Degraded.to_string(), "DEGRADED");
    }
}
