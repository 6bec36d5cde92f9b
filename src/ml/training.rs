//! Model training
//!
//! Closed-form ridge regression is the production model. The gradient-descent
//! linear model only serves the operator hyperparameter sweep.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::LinearRegressionModel;
use super::scaler::FeatureScaler;
use super::{FeatureVector, ValidationMetrics};

/// Hard floor for the solver itself; the engine applies its own, larger one
pub const MIN_TRAINER_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrainerError {
    #[error("Insufficient samples: need {required}, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },
    #[error("Feature and target count mismatch: {features} features, {targets} targets")]
    DimensionMismatch { features: usize, targets: usize },
    #[error("Training samples have inconsistent feature layout")]
    InconsistentLayout,
    #[error("Training data contains non-finite values")]
    NonFinite,
    #[error("Linear system is singular for every regularization strength")]
    Singular,
    #[error("Linear algebra backend not available in this build")]
    NumericDependencyMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeConfig {
    pub lambda_candidates: Vec<f64>,
    pub validation_split: f64,
    pub default_lambda: f64,
    pub min_samples: usize,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            lambda_candidates: vec![0.001, 0.01, 0.1, 1.0, 10.0, 100.0],
            validation_split: 0.2,
            default_lambda: 0.1,
            min_samples: MIN_TRAINER_SAMPLES,
        }
    }
}

/// Result of a ridge training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeFit {
    pub bias: f64,
    pub weights: BTreeMap<String, f64>,
    pub feature_names: Vec<String>,
    pub lambda: f64,
    /// Held-out R² of the chosen lambda when tuning ran, training R² otherwise; in [0, 1]
    pub accuracy: f64,
    pub training_metrics: ValidationMetrics,
    pub validation_r2: Option<f64>,
    pub samples: usize,
}

impl RidgeFit {
    pub fn weight_norm(&self) -> f64 {
        self.weights.values().map(|w| w * w).sum::<f64>().sqrt()
    }
}

/// Solve (XᵀX + λD)β = Xᵀy where X carries a trailing bias column and D is
/// the identity with a zero in the bias position. Returns (weights, bias).
#[cfg(feature = "linalg")]
pub fn solve_ridge(rows: &[Vec<f64>], targets: &[f64], lambda: f64) -> Result<(Vec<f64>, f64), TrainerError> {
    use nalgebra::{DMatrix, DVector};

    let n = rows.len();
    let p = rows.first().map_or(0, Vec::len);
    let x = DMatrix::from_fn(n, p + 1, |r, c| if c < p { rows[r][c] } else { 1.0 });
    let y = DVector::from_column_slice(targets);

    let mut xtx = x.tr_mul(&x);
    for i in 0..p {
        xtx[(i, i)] += lambda;
    }
    let xty = x.tr_mul(&y);

    let beta = xtx
        .clone()
        .cholesky()
        .map(|c| c.solve(&xty))
        .or_else(|| xtx.lu().solve(&xty))
        .ok_or(TrainerError::Singular)?;

    if beta.iter().any(|b| !b.is_finite()) {
        return Err(TrainerError::Singular);
    }
    Ok((beta.iter().take(p).copied().collect(), beta[p]))
}

#[cfg(not(feature = "linalg"))]
pub fn solve_ridge(_rows: &[Vec<f64>], _targets: &[f64], _lambda: f64) -> Result<(Vec<f64>, f64), TrainerError> {
    Err(TrainerError::NumericDependencyMissing)
}

fn predict_rows(rows: &[Vec<f64>], weights: &[f64], bias: f64) -> Vec<f64> {
    rows.iter()
        .map(|row| row.iter().zip(weights).map(|(x, w)| x * w).sum::<f64>() + bias)
        .collect()
}

pub struct RidgeTrainer {
    config: RidgeConfig,
}

impl RidgeTrainer {
    pub fn new(config: RidgeConfig) -> Self {
        Self { config }
    }

    /// Fit on already-scaled features. Deterministic for identical input order.
    pub fn train(&self, samples: &[FeatureVector], targets: &[f64]) -> Result<RidgeFit, TrainerError> {
        if samples.len() != targets.len() {
            return Err(TrainerError::DimensionMismatch {
                features: samples.len(),
                targets: targets.len(),
            });
        }
        let required = self.config.min_samples.max(MIN_TRAINER_SAMPLES);
        if samples.len() < required {
            return Err(TrainerError::InsufficientSamples {
                required,
                actual: samples.len(),
            });
        }

        let feature_names = samples[0].feature_names.clone();
        if samples
            .iter()
            .any(|s| s.feature_names != feature_names || !s.is_consistent())
        {
            return Err(TrainerError::InconsistentLayout);
        }
        let rows: Vec<Vec<f64>> = samples.iter().map(|s| s.features.clone()).collect();
        if rows.iter().flatten().chain(targets).any(|v| !v.is_finite()) {
            return Err(TrainerError::NonFinite);
        }

        let (lambda, validation_r2) = self.select_lambda(&rows, targets, feature_names.len())?;
        let (weights, bias) = solve_ridge(&rows, targets, lambda)?;

        let predictions = predict_rows(&rows, &weights, bias);
        let training_metrics =
            ValidationMetrics::calculate(&predictions, targets).ok_or(TrainerError::NonFinite)?;
        let accuracy = validation_r2
            .map(|r2| r2.clamp(0.0, 1.0))
            .unwrap_or_else(|| training_metrics.accuracy());

        debug!(lambda, accuracy, samples = rows.len(), "ridge fit complete");

        Ok(RidgeFit {
            bias,
            weights: feature_names.iter().cloned().zip(weights).collect(),
            feature_names,
            lambda,
            accuracy,
            training_metrics,
            validation_r2,
            samples: rows.len(),
        })
    }

    /// Chronological holdout search over the lambda grid. Falls back to the
    /// default lambda when the holdout is too small to be meaningful.
    fn select_lambda(
        &self,
        rows: &[Vec<f64>],
        targets: &[f64],
        n_features: usize,
    ) -> Result<(f64, Option<f64>), TrainerError> {
        let split = ((rows.len() as f64) * (1.0 - self.config.validation_split)).floor() as usize;
        let validation_size = rows.len() - split;
        let min_validation = MIN_TRAINER_SAMPLES.max(n_features + 1);

        if validation_size < min_validation || split < MIN_TRAINER_SAMPLES {
            debug!(validation_size, min_validation, "holdout too small, using default lambda");
            return Ok((self.config.default_lambda, None));
        }

        let (train_x, val_x) = rows.split_at(split);
        let (train_y, val_y) = targets.split_at(split);

        let mut best: Option<(f64, f64)> = None;
        for &lambda in &self.config.lambda_candidates {
            let (weights, bias) = match solve_ridge(train_x, train_y, lambda) {
                Ok(solution) => solution,
                Err(TrainerError::Singular) => {
                    debug!(lambda, "singular system, skipping candidate");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let score = ValidationMetrics::calculate(&predict_rows(val_x, &weights, bias), val_y)
                .map_or(f64::NEG_INFINITY, |m| m.r2);
            debug!(lambda, r2 = score, "lambda candidate scored");
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((lambda, score));
            }
        }

        Ok(best
            .filter(|(_, score)| score.is_finite())
            .map_or((self.config.default_lambda, None), |(lambda, score)| {
                (lambda, Some(score))
            }))
    }
}

/// Gradient-descent settings for the alternate linear model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientDescentConfig {
    pub learning_rate: f64,
    pub max_iterations: usize,
    /// Stop once the loss improves by less than this between iterations
    pub tolerance: f64,
}

impl Default for GradientDescentConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            max_iterations: 1000,
            tolerance: 1e-9,
        }
    }
}

pub struct GradientDescentTrainer {
    config: GradientDescentConfig,
}

impl GradientDescentTrainer {
    pub fn new(config: GradientDescentConfig) -> Self {
        Self { config }
    }

    /// Full-batch gradient descent on mean squared error
    pub fn train(&self, rows: &[Vec<f64>], targets: &[f64]) -> Result<LinearRegressionModel, TrainerError> {
        if rows.len() != targets.len() {
            return Err(TrainerError::DimensionMismatch {
                features: rows.len(),
                targets: targets.len(),
            });
        }
        if rows.is_empty() {
            return Err(TrainerError::InsufficientSamples {
                required: 1,
                actual: 0,
            });
        }

        let n_features = rows[0].len();
        let n = rows.len() as f64;
        let mut model = LinearRegressionModel::new(vec![0.0; n_features], 0.0);
        let mut previous_loss = f64::INFINITY;

        for _ in 0..self.config.max_iterations {
            let mut coef_gradients = vec![0.0; n_features];
            let mut intercept_gradient = 0.0;
            let mut loss = 0.0;

            for (row, target) in rows.iter().zip(targets) {
                let error = model.predict(row) - target;
                loss += error * error / n;
                for (gradient, x) in coef_gradients.iter_mut().zip(row) {
                    *gradient += error * x / n;
                }
                intercept_gradient += error / n;
            }

            if !loss.is_finite() {
                return Err(TrainerError::NonFinite);
            }
            if (previous_loss - loss).abs() < self.config.tolerance {
                break;
            }
            previous_loss = loss;

            for (coefficient, gradient) in model.coefficients.iter_mut().zip(&coef_gradients) {
                *coefficient -= self.config.learning_rate * gradient;
            }
            model.intercept -= self.config.learning_rate * intercept_gradient;
        }

        Ok(model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub learning_rate: f64,
    pub max_iterations: usize,
    /// None when training diverged
    pub validation_r2: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub points: Vec<SweepPoint>,
    pub best: Option<SweepPoint>,
    pub training_samples: usize,
    pub validation_samples: usize,
}

/// Grid search over learning rate × iterations for the gradient-descent model
pub struct HyperparameterSweep {
    pub learning_rates: Vec<f64>,
    pub max_iterations: Vec<usize>,
    pub validation_split: f64,
}

impl HyperparameterSweep {
    pub fn run(&self, samples: &[FeatureVector], targets: &[f64]) -> Result<SweepReport, TrainerError> {
        if samples.len() != targets.len() {
            return Err(TrainerError::DimensionMismatch {
                features: samples.len(),
                targets: targets.len(),
            });
        }
        let split = ((samples.len() as f64) * (1.0 - self.validation_split)).floor() as usize;
        if split < MIN_TRAINER_SAMPLES || samples.len() - split < 2 {
            return Err(TrainerError::InsufficientSamples {
                required: MIN_TRAINER_SAMPLES + 2,
                actual: samples.len(),
            });
        }

        // Scaler is fit on the training part only
        let (train, validation) = samples.split_at(split);
        let (train_y, val_y) = targets.split_at(split);
        let mut scaler = FeatureScaler::default();
        let train_x: Vec<Vec<f64>> = scaler
            .fit_transform(train)
            .map_err(|_| TrainerError::InconsistentLayout)?
            .into_iter()
            .map(|fv| fv.features)
            .collect();
        let val_x: Vec<Vec<f64>> = validation
            .iter()
            .map(|fv| scaler.transform(fv).map(|s| s.vector.features))
            .collect::<Result<_, _>>()
            .map_err(|_| TrainerError::InconsistentLayout)?;

        let mut points = Vec::new();
        for &learning_rate in &self.learning_rates {
            for &max_iterations in &self.max_iterations {
                let trainer = GradientDescentTrainer::new(GradientDescentConfig {
                    learning_rate,
                    max_iterations,
                    ..Default::default()
                });
                let validation_r2 = trainer.train(&train_x, train_y).ok().and_then(|model| {
                    let predictions: Vec<f64> = val_x.iter().map(|row| model.predict(row)).collect();
                    ValidationMetrics::calculate(&predictions, val_y)
                        .map(|m| m.r2)
                        .filter(|r2| r2.is_finite())
                });
                debug!(learning_rate, max_iterations, ?validation_r2, "sweep point");
                points.push(SweepPoint {
                    learning_rate,
                    max_iterations,
                    validation_r2,
                });
            }
        }

        let best = points
            .iter()
            .filter(|p| p.validation_r2.is_some())
            .max_by(|a, b| {
                let (a, b) = (a.validation_r2.unwrap_or(f64::NEG_INFINITY), b.validation_r2.unwrap_or(f64::NEG_INFINITY));
                a.total_cmp(&b)
            })
            .cloned();

        Ok(SweepReport {
            points,
            best,
            training_samples: train_x.len(),
            validation_samples: val_x.len(),
        })
    }
}
