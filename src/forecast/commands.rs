//! Operator commands: training, reset, calibration, sweep, feedback

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::engine::{ForecastOrchestrator, ModelSnapshot};
use super::history::HistoricalCache;
use crate::calibration::{CalibrationObservation, CalibrationTable};
use crate::domain::{CalibrationResult, TrainingRecord, TrainingResult};
use crate::error::EngineError;
use crate::ml::{
    FeatureEngineer, FeatureScaler, HourlyProfile, HyperparameterSweep, LearnedWeights, ModelState, ModelStatus,
    RidgeConfig, RidgeFit, RidgeTrainer, SweepReport, TrainerError,
};

const CORRECTION_ALPHA: f64 = 0.1;

struct TrainedModel {
    fit: RidgeFit,
    scaler: FeatureScaler,
    profile: HourlyProfile,
}

/// Feature extraction, scaling, ridge fit and profile rebuild. CPU-bound;
/// runs on the blocking pool.
fn fit_model(
    records: &[TrainingRecord],
    history: &HistoricalCache,
    features: FeatureEngineer,
    ridge: RidgeConfig,
) -> Result<TrainedModel, TrainerError> {
    let set = features.build_training_set(records, history);
    let mut scaler = FeatureScaler::default();
    let scaled = scaler
        .fit_transform(&set.features)
        .map_err(|_| TrainerError::InconsistentLayout)?;
    let fit = RidgeTrainer::new(ridge).train(&scaled, &set.targets)?;
    Ok(TrainedModel {
        fit,
        scaler,
        profile: HourlyProfile::from_records(records),
    })
}

impl ForecastOrchestrator {
    /// Retrain now. Only one run at a time; a concurrent call returns a
    /// failed result immediately. The committed model is untouched unless
    /// the new one is fully trained and persisted.
    pub async fn train(&self) -> TrainingResult {
        let Ok(_guard) = self.training_lock.try_lock() else {
            return TrainingResult::failed("training already in progress", 0, 0.0);
        };
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let had_model = self.snapshot().weights.is_trained();

        if self.status.read().state == ModelState::Error {
            self.note_numeric_missing();
            return TrainingResult::failed(TrainerError::NumericDependencyMissing.to_string(), 0, 0.0);
        }
        let previous_state = self.status.read().state;
        self.status.write().state = ModelState::Training;
        info!(%run_id, had_model, "training started");

        let records = match self.records.records(self.config.training.history_days).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "could not load training records");
                return self
                    .fail_training(previous_state, had_model, format!("record source failed: {e}"), 0, started)
                    .await;
            }
        };
        let usable = records.iter().filter(|r| r.is_usable()).count();

        if usable < self.config.training.min_samples {
            // Cancelled: nothing is written
            let message = format!(
                "insufficient training data: need {}, got {usable}",
                self.config.training.min_samples
            );
            warn!(%run_id, samples = usable, required = self.config.training.min_samples, "training cancelled");
            self.status.write().state = restore_state(previous_state, had_model);
            return TrainingResult::failed(message, usable, started.elapsed().as_secs_f64());
        }

        let history = HistoricalCache::from_records(&records);
        let ridge = RidgeConfig {
            lambda_candidates: self.config.training.lambda_candidates.clone(),
            validation_split: self.config.training.validation_split,
            default_lambda: self.config.training.default_lambda,
            min_samples: self.config.training.min_samples,
        };
        let features = self.features;
        let job_history = history.clone();
        let job = tokio::task::spawn_blocking(move || fit_model(&records, &job_history, features, ridge)).await;

        let trained = match job {
            Ok(Ok(trained)) => trained,
            Ok(Err(TrainerError::NumericDependencyMissing)) => {
                self.note_numeric_missing();
                let mut status = self.status.write();
                status.state = ModelState::Error;
                status.numeric_backend_available = false;
                drop(status);
                return TrainingResult::failed(
                    TrainerError::NumericDependencyMissing.to_string(),
                    usable,
                    started.elapsed().as_secs_f64(),
                );
            }
            Ok(Err(e)) => {
                warn!(%run_id, error = %e, "training failed");
                return self
                    .fail_training(previous_state, had_model, e.to_string(), usable, started)
                    .await;
            }
            Err(e) => {
                error!(error = %e, "training task panicked or was cancelled");
                return self
                    .fail_training(previous_state, had_model, format!("training task failed: {e}"), usable, started)
                    .await;
            }
        };

        let now = Utc::now();
        let commit = self.commit_lock.lock().await;
        let current = self.snapshot();
        let weights = LearnedWeights {
            weights: trained.fit.weights.clone(),
            bias: trained.fit.bias,
            feature_names: trained.fit.feature_names.clone(),
            scaler: trained.scaler.state().clone(),
            accuracy: Some(trained.fit.accuracy),
            training_samples: trained.fit.samples,
            last_trained: Some(now),
            lambda: Some(trained.fit.lambda),
            correction_factor: current.weights.correction_factor,
        };

        if let Err(e) = self.store.save_weights(&weights).await {
            drop(commit);
            error!(error = %e, "could not persist new weights, keeping previous model");
            return self
                .fail_training(previous_state, had_model, format!("persisting weights failed: {e}"), usable, started)
                .await;
        }
        if let Err(e) = self.store.save_profile(&trained.profile).await {
            warn!(error = %e, "could not persist hourly profile");
        }

        let snapshot = ModelSnapshot {
            weights,
            scaler: trained.scaler,
            profile: trained.profile,
            calibration: current.calibration.clone(),
        };
        let state = self.evaluate_state(&snapshot.weights);
        *self.snapshot.write() = Arc::new(snapshot);
        *self.history.write() = Arc::new(history);
        drop(commit);

        let duration_secs = started.elapsed().as_secs_f64();
        let status = {
            let mut status = self.status.write();
            status.state = state;
            status.accuracy = Some(trained.fit.accuracy);
            status.training_samples = trained.fit.samples;
            status.last_trained = Some(now);
            status.last_training_duration_secs = Some(duration_secs);
            status.consecutive_failures = 0;
            status.last_error = None;
            status.clone()
        };
        self.persist_status(&status).await;

        info!(
            %run_id,
            samples = trained.fit.samples,
            accuracy = trained.fit.accuracy,
            lambda = trained.fit.lambda,
            state = %state,
            duration_secs,
            "training complete"
        );

        TrainingResult {
            success: true,
            accuracy: Some(trained.fit.accuracy),
            samples_used: trained.fit.samples,
            duration_secs,
            feature_count: trained.fit.feature_names.len(),
            lambda: Some(trained.fit.lambda),
            error_message: None,
        }
    }

    async fn fail_training(
        &self,
        previous_state: ModelState,
        had_model: bool,
        message: String,
        samples: usize,
        started: Instant,
    ) -> TrainingResult {
        let status = {
            let mut status = self.status.write();
            status.state = restore_state(previous_state, had_model);
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.last_error = Some(message.clone());
            status.clone()
        };
        self.persist_status(&status).await;
        TrainingResult::failed(message, samples, started.elapsed().as_secs_f64())
    }

    async fn persist_status(&self, status: &ModelStatus) {
        if let Err(e) = self.store.save_status(status).await {
            warn!(error = %e, "could not persist model status");
        }
    }

    /// Drop learned weights and profile. Calibration is kept.
    pub async fn reset_model(&self) -> Result<(), EngineError> {
        let Ok(_guard) = self.training_lock.try_lock() else {
            return Err(EngineError::ModelUnavailable("training in progress".into()));
        };
        let _commit = self.commit_lock.lock().await;

        self.store.save_weights(&LearnedWeights::default()).await?;
        self.store.save_profile(&HourlyProfile::default()).await?;

        let calibration = self.snapshot().calibration.clone();
        *self.snapshot.write() = Arc::new(ModelSnapshot::new(
            LearnedWeights::default(),
            HourlyProfile::default(),
            calibration,
        ));

        let status = {
            let mut status = self.status.write();
            let numeric_backend_available = status.numeric_backend_available;
            *status = ModelStatus {
                state: if numeric_backend_available {
                    ModelState::Uninitialized
                } else {
                    ModelState::Error
                },
                numeric_backend_available,
                ..Default::default()
            };
            status.clone()
        };
        self.persist_status(&status).await;
        info!("model reset");
        Ok(())
    }

    /// Nudge the correction factor toward actual/predicted for a finished day
    pub async fn record_daily_outcome(&self, predicted_kwh: f64, actual_kwh: f64) -> Result<f64, EngineError> {
        let _commit = self.commit_lock.lock().await;
        let current = self.snapshot();
        let factor = current.weights.correction_factor;

        if !(predicted_kwh.is_finite() && actual_kwh.is_finite()) || predicted_kwh <= 0.0 || actual_kwh < 0.0 {
            warn!(predicted_kwh, actual_kwh, "daily outcome ignored");
            return Ok(factor);
        }

        let ratio = actual_kwh / predicted_kwh;
        let mut weights = current.weights.clone();
        weights.set_correction_factor(factor + CORRECTION_ALPHA * (ratio - factor));
        self.store.save_weights(&weights).await?;

        let updated = weights.correction_factor;
        *self.snapshot.write() = Arc::new(ModelSnapshot {
            weights,
            ..(*current).clone()
        });
        info!(ratio, previous = factor, correction_factor = updated, "correction factor updated");
        Ok(updated)
    }

    /// Normal calibration pass over host-supplied observations
    pub async fn run_calibration(&self, observations: &[CalibrationObservation]) -> CalibrationResult {
        let cfg = self.config.calibration.clone();
        let observations = observations.to_vec();
        self.update_calibration(move |table| table.apply_observations(&observations, &cfg))
            .await
    }

    /// Rescue pass for groups whose actual output is many times the physics
    pub async fn rescue_calibration(&self, observations: &[CalibrationObservation], today: NaiveDate) -> CalibrationResult {
        let cfg = self.config.calibration.clone();
        let observations = observations.to_vec();
        let capacities: Vec<(String, f64)> = self
            .physics
            .groups()
            .iter()
            .map(|g| (g.name.clone(), g.power_kwp()))
            .collect();
        // Observations for a group the site does not list are judged against
        // the whole array, as the implicit group is
        let site_kwp = self.config.site.capacity_kwp;
        self.update_calibration(move |table| {
            table.rescue(
                &observations,
                today,
                |name| {
                    capacities
                        .iter()
                        .find(|(group, _)| group == name)
                        .map_or(site_kwp, |(_, kwp)| *kwp)
                },
                &cfg,
            )
        })
        .await
    }

    async fn update_calibration<F>(&self, update: F) -> CalibrationResult
    where
        F: FnOnce(&mut CalibrationTable) -> CalibrationResult,
    {
        let _commit = self.commit_lock.lock().await;
        let current = self.snapshot();
        let mut table = current.calibration.clone();
        let result = update(&mut table);
        if table == current.calibration {
            return result;
        }

        if let Err(e) = self.store.save_calibration(&table).await {
            error!(error = %e, "could not persist calibration, keeping previous factors");
            return CalibrationResult {
                success: false,
                message: format!("persisting calibration failed: {e}"),
                ..result
            };
        }
        *self.snapshot.write() = Arc::new(ModelSnapshot {
            calibration: table,
            ..(*current).clone()
        });
        result
    }

    /// Grid search for the gradient-descent model. Reports only; the
    /// committed model does not change.
    pub async fn hyperparameter_sweep(&self) -> Result<SweepReport, EngineError> {
        let records = self
            .records
            .records(self.config.training.history_days)
            .await
            .map_err(|e| EngineError::ModelUnavailable(format!("record source failed: {e}")))?;
        let features = self.features;
        let sweep = HyperparameterSweep {
            learning_rates: self.config.training.sweep_learning_rates.clone(),
            max_iterations: self.config.training.sweep_max_iterations.clone(),
            validation_split: self.config.training.validation_split,
        };

        let report = tokio::task::spawn_blocking(move || {
            let history = HistoricalCache::from_records(&records);
            let set = features.build_training_set(&records, &history);
            sweep.run(&set.features, &set.targets)
        })
        .await
        .map_err(|e| EngineError::ModelUnavailable(format!("sweep task failed: {e}")))??;

        if let Some(best) = &report.best {
            info!(
                learning_rate = best.learning_rate,
                max_iterations = best.max_iterations,
                r2 = best.validation_r2,
                "hyperparameter sweep complete"
            );
        } else {
            warn!("hyperparameter sweep found no converging configuration");
        }
        Ok(report)
    }

    /// Current model health; a model that aged past the staleness limit
    /// reports as degraded.
    pub fn status(&self) -> ModelStatus {
        let mut status = self.status.read().clone();
        if status.state.has_model() {
            status.state = self.evaluate_state(&self.snapshot().weights);
        }
        status
    }
}

fn restore_state(previous: ModelState, had_model: bool) -> ModelState {
    match previous {
        ModelState::Degraded if had_model => ModelState::Degraded,
        _ => ModelState::after_failed_training(had_model),
    }
}
