use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::history::HistoricalCache;
use super::safeguard::Safeguard;
use super::window::is_production_hour;
use crate::calibration::CalibrationTable;
use crate::config::Config;
use crate::domain::{
    DayInput, ForecastMethod, ForecastRequest, ForecastResult, HourInput, HourlyForecast, NormalizedWeather,
};
use crate::error::EngineError;
use crate::ml::{
    FeatureEngineer, FeatureScaler, HourlyProfile, LagFeatures, LearnedWeights, ModelState, ModelStatus,
    ProductionHistory, StrategyChain, StrategyContext, StrategyInput, StrategyPrediction,
};
use crate::physics::{HourConditions, PanelGroupEngine, SunPosition};
use crate::repo::{StateStore, StoreError, TrainingRecordSource};

/// Everything a forecast reads. Replaced as a whole on commit, so a forecast
/// never sees weights from one training run with a scaler from another.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    pub weights: LearnedWeights,
    pub scaler: FeatureScaler,
    pub profile: HourlyProfile,
    pub calibration: CalibrationTable,
}

impl ModelSnapshot {
    pub fn new(weights: LearnedWeights, profile: HourlyProfile, calibration: CalibrationTable) -> Self {
        Self {
            scaler: FeatureScaler::from_state(weights.scaler.clone()),
            weights,
            profile,
            calibration,
        }
    }

    pub fn model_accuracy(&self) -> Option<f64> {
        self.weights.is_trained().then_some(self.weights.accuracy).flatten()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("Forecast request contains no days")]
    EmptyRequest,
    #[error("Day {0} appears more than once")]
    DuplicateDay(NaiveDate),
    #[error("Invalid UTC offset: {0} minutes")]
    InvalidOffset(i32),
}

/// Top-level composer of physics and learned predictions
pub struct ForecastOrchestrator {
    pub(super) config: Config,
    pub(super) store: Arc<dyn StateStore>,
    pub(super) records: Arc<dyn TrainingRecordSource>,
    pub(super) physics: PanelGroupEngine,
    pub(super) features: FeatureEngineer,
    pub(super) chain: StrategyChain,
    pub(super) snapshot: RwLock<Arc<ModelSnapshot>>,
    pub(super) history: RwLock<Arc<HistoricalCache>>,
    pub(super) status: RwLock<ModelStatus>,
    /// Held for the whole of a training or reset run
    pub(super) training_lock: tokio::sync::Mutex<()>,
    /// Serializes read-modify-swap of the snapshot
    pub(super) commit_lock: tokio::sync::Mutex<()>,
    pub(super) numeric_missing_logged: AtomicBool,
}

impl ForecastOrchestrator {
    /// Load persisted state and build the historical cache. Corrupt state
    /// reverts to defaults with a warning; an unreachable store is fatal.
    pub async fn initialize(
        config: Config,
        store: Arc<dyn StateStore>,
        records: Arc<dyn TrainingRecordSource>,
    ) -> Result<Self, EngineError> {
        let weights = load_or_default(store.load_weights().await, "learned weights")?;
        let profile = load_or_default(store.load_profile().await, "hourly profile")?;
        let calibration = load_or_default(store.load_calibration().await, "calibration")?;
        let mut status: ModelStatus = load_or_default(store.load_status().await, "model status")?;

        let physics = PanelGroupEngine::new(
            config.site.panel_groups.clone(),
            config.site.capacity_kwp,
            config.site.albedo,
            config.site.system_efficiency,
            config.calibration.low_sun_elevation_deg,
        );

        let history = match records.records(config.training.history_days).await {
            Ok(records) => HistoricalCache::from_records(&records),
            Err(e) => {
                warn!(error = %e, "could not load production history, lag features start empty");
                HistoricalCache::default()
            }
        };

        let snapshot = ModelSnapshot::new(weights, profile, calibration);
        status.numeric_backend_available = numeric_backend_available();

        let orchestrator = Self {
            physics,
            features: FeatureEngineer::default(),
            chain: StrategyChain::default(),
            snapshot: RwLock::new(Arc::new(snapshot)),
            history: RwLock::new(Arc::new(history)),
            status: RwLock::new(status),
            training_lock: tokio::sync::Mutex::new(()),
            commit_lock: tokio::sync::Mutex::new(()),
            numeric_missing_logged: AtomicBool::new(false),
            config,
            store,
            records,
        };

        let state = if orchestrator.status.read().numeric_backend_available {
            orchestrator.evaluate_state(&orchestrator.snapshot().weights)
        } else {
            orchestrator.note_numeric_missing();
            ModelState::Error
        };
        orchestrator.status.write().state = state;

        info!(
            state = %state,
            groups = orchestrator.physics.groups().len(),
            capacity_kwp = orchestrator.physics.total_capacity_kwp(),
            history_days = orchestrator.history.read().len_days(),
            "forecast engine initialized"
        );
        Ok(orchestrator)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn physics(&self) -> &PanelGroupEngine {
        &self.physics
    }

    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.snapshot.read().clone()
    }

    pub(super) fn history_snapshot(&self) -> Arc<HistoricalCache> {
        self.history.read().clone()
    }

    /// Ready or degraded, judged from accuracy and model age
    pub(super) fn evaluate_state(&self, weights: &LearnedWeights) -> ModelState {
        if !weights.is_trained() {
            return ModelState::Uninitialized;
        }
        let weak = weights
            .accuracy
            .map_or(false, |a| a < self.config.training.degraded_accuracy);
        let stale = weights
            .last_trained
            .map_or(true, |t| {
                Duration::try_days(self.config.training.stale_after_days).map_or(false, |limit| Utc::now() - t > limit)
            });
        if weak || stale {
            ModelState::Degraded
        } else {
            ModelState::Ready
        }
    }

    /// Log the missing backend once per process
    pub(super) fn note_numeric_missing(&self) {
        if !self.numeric_missing_logged.swap(true, Ordering::SeqCst) {
            error!(
                kind = %crate::error::ErrorKind::NumericDependencyMissing,
                "linear algebra backend not compiled in; only the deterministic fallback will run"
            );
        }
    }

    /// Hourly and daily forecast. Never fails: anything unexpected yields the
    /// zeroed `fallback_empty` result.
    pub fn forecast(&self, request: &ForecastRequest) -> ForecastResult {
        let snapshot = self.snapshot();
        match self.try_forecast(request, &snapshot) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "forecast failed, returning empty result");
                ForecastResult::fallback_empty(snapshot.model_accuracy())
            }
        }
    }

    fn try_forecast(&self, request: &ForecastRequest, snapshot: &ModelSnapshot) -> Result<ForecastResult, ForecastError> {
        let first = request.days.first().ok_or(ForecastError::EmptyRequest)?;
        let mut seen = std::collections::HashSet::new();
        if let Some(day) = request.days.iter().find(|d| !seen.insert(d.date)) {
            return Err(ForecastError::DuplicateDay(day.date));
        }
        let offset = utc_offset(request.utc_offset_minutes)?;

        let history = self.history_snapshot();
        let ctx = self.strategy_context(snapshot);

        let mut hourly = Vec::new();
        let mut totals = Vec::with_capacity(request.days.len());
        let mut previous_total: Option<f64> = None;
        let mut last_hour = first
            .hours
            .iter()
            .map(|h| h.hour)
            .min()
            .and_then(|hour| first.date.and_hms_opt(hour, 0, 0))
            .and_then(|t| LagFeatures::from_history(history.as_ref(), t).production_last_hour);

        for (index, day) in request.days.iter().enumerate() {
            let production_yesterday = if index == 0 {
                day.date.pred_opt().and_then(|d| history.daily_total(d))
            } else {
                previous_total
            };

            let day_hours = self.forecast_day(day, snapshot, &ctx, production_yesterday, &mut last_hour, offset);
            let total: f64 = day_hours.iter().map(|h| h.kwh).sum();
            debug!(date = %day.date, total_kwh = total, hours = day_hours.len(), "day forecast");
            previous_total = Some(total);
            totals.push(total);
            hourly.extend(day_hours);
        }

        let today = first.date;
        let today_raw = totals[0];
        let mut today_kwh = today_raw;
        let mut safeguard_applied = false;

        let safeguard = Safeguard {
            ratio: self.config.forecast.safeguard_ratio,
            min_history_days: self.config.forecast.safeguard_min_history_days,
        };
        let recent = history.recent_daily_totals(today, self.config.forecast.safeguard_lookback_days);
        if let Some(cap) = safeguard.cap(today_raw, &recent) {
            let scale = if today_raw > 0.0 { cap / today_raw } else { 0.0 };
            for hour in hourly.iter_mut().filter(|h| h.date == today) {
                hour.kwh *= scale;
            }
            today_kwh = cap;
            safeguard_applied = true;
            warn!(raw_kwh = today_raw, capped_kwh = cap, "safeguard capped today's forecast");
        }

        let today_hours: Vec<&HourlyForecast> = hourly.iter().filter(|h| h.date == today).collect();
        let best = today_hours
            .iter()
            .filter(|h| h.kwh > 0.0)
            .max_by_key(|h| OrderedFloat(h.kwh));

        Ok(ForecastResult {
            today_kwh,
            tomorrow_kwh: totals.get(1).copied().unwrap_or(0.0),
            day_after_kwh: totals.get(2).copied().unwrap_or(0.0),
            today_kwh_raw: today_raw,
            safeguard_applied,
            best_hour: best.map(|h| h.hour),
            best_hour_kwh: best.map(|h| h.kwh),
            confidence: overall_confidence(&today_hours),
            method: dominant_method(&today_hours),
            model_accuracy: snapshot.model_accuracy(),
            hourly,
        })
    }

    fn forecast_day(
        &self,
        day: &DayInput,
        snapshot: &ModelSnapshot,
        ctx: &StrategyContext<'_>,
        production_yesterday: Option<f64>,
        last_hour: &mut Option<f64>,
        offset: Duration,
    ) -> Vec<HourlyForecast> {
        let mut hours: Vec<&HourInput> = day.hours.iter().filter(|h| h.hour < 24).collect();
        if hours.len() != day.hours.len() {
            warn!(date = %day.date, "ignoring hours outside 0-23");
        }
        hours.sort_by_key(|h| h.hour);
        hours.dedup_by_key(|h| h.hour);

        hours
            .into_iter()
            .map(|input| {
                let lags = LagFeatures {
                    production_yesterday,
                    production_last_hour: *last_hour,
                };
                let forecast = self.predict_hour(day.date, input, lags, snapshot, ctx, offset);
                *last_hour = Some(forecast.kwh);
                forecast
            })
            .collect()
    }

    /// One hour: strategy chain, physics, merge, production window
    fn predict_hour(
        &self,
        date: NaiveDate,
        input: &HourInput,
        lags: LagFeatures,
        snapshot: &ModelSnapshot,
        ctx: &StrategyContext<'_>,
        offset: Duration,
    ) -> HourlyForecast {
        let weather = NormalizedWeather::from_snapshots(&input.weather, input.sensor.as_ref());
        let time = date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(input.hour));

        let raw = self.features.extract(&weather, time, lags);
        let learned = self.chain.predict(&StrategyInput { hour: input.hour, raw }, ctx);
        let physics = self.physics_estimate(time, input, &weather, &snapshot.calibration, offset);
        let merged = self.merge(physics, learned);

        let (in_window, source) = is_production_hour(date.month(), input.hour, input.astronomy.as_ref());
        let kwh = if in_window { merged.kwh } else { 0.0 };
        if !in_window && merged.kwh > 0.0 {
            debug!(%date, hour = input.hour, %source, dropped_kwh = merged.kwh, "hour outside production window");
        }

        HourlyForecast {
            date,
            hour: input.hour,
            kwh,
            method: merged.method,
            confidence: merged.confidence,
        }
    }

    /// Calibrated physics output for the hour, or `None` without irradiance data
    fn physics_estimate(
        &self,
        time: NaiveDateTime,
        input: &HourInput,
        weather: &NormalizedWeather,
        calibration: &CalibrationTable,
        offset: Duration,
    ) -> Option<f64> {
        let sun = input
            .astronomy
            .as_ref()
            .and_then(|a| a.sun_position())
            .unwrap_or_else(|| {
                let mid_hour = time + Duration::minutes(30) - offset;
                SunPosition::estimate(
                    mid_hour.and_utc(),
                    self.config.site.latitude,
                    self.config.site.longitude,
                )
            });

        let irradiance = weather.irradiance(&sun)?;
        if !irradiance.is_valid() {
            debug!(
                hour = input.hour,
                kind = %crate::error::ErrorKind::PhysicalImplausibility,
                ghi = irradiance.ghi,
                dni = irradiance.dni,
                dhi = irradiance.dhi,
                "irradiance out of range, physics output is zero"
            );
        }

        let conditions = HourConditions {
            hour: input.hour,
            irradiance,
            sun,
            ambient_temp_c: weather.temperature,
            cloud_cover_percent: weather.cloud_cover_percent,
        };
        let total = self.physics.calculate_total(&conditions, calibration).total_power_kwh;
        Some(clamp_kwh(total, self.config.hourly_ceiling_kwh()))
    }

    /// Physics plus learned model blend by confidence; any other pairing
    /// keeps the more confident candidate.
    fn merge(&self, physics: Option<f64>, chain: StrategyPrediction) -> StrategyPrediction {
        let Some(physics_kwh) = physics else {
            return chain;
        };
        let physics_confidence = self.config.forecast.physics_confidence;

        if chain.method == ForecastMethod::MlModel {
            let weight = physics_confidence + chain.confidence;
            let kwh = if weight > 0.0 {
                (physics_kwh * physics_confidence + chain.kwh * chain.confidence) / weight
            } else {
                (physics_kwh + chain.kwh) / 2.0
            };
            return StrategyPrediction {
                kwh: clamp_kwh(kwh, self.config.hourly_ceiling_kwh()),
                confidence: physics_confidence.max(chain.confidence),
                method: ForecastMethod::Hybrid,
            };
        }

        if physics_confidence >= chain.confidence {
            StrategyPrediction {
                kwh: physics_kwh,
                confidence: physics_confidence,
                method: ForecastMethod::Physics,
            }
        } else {
            chain
        }
    }

    pub(super) fn strategy_context<'a>(&'a self, snapshot: &'a ModelSnapshot) -> StrategyContext<'a> {
        StrategyContext {
            weights: &snapshot.weights,
            scaler: &snapshot.scaler,
            profile: &snapshot.profile,
            capacity_kwp: self.config.site.capacity_kwp,
            config: &self.config.forecast,
            learned_enabled: self.status.read().state != ModelState::Error,
        }
    }

    /// Forecast for a single upcoming hour, with lags from the cache
    pub fn predict_next_hour(&self, date: NaiveDate, input: &HourInput, utc_offset_minutes: i32) -> HourlyForecast {
        let snapshot = self.snapshot();
        let history = self.history_snapshot();
        let ctx = self.strategy_context(&snapshot);
        let offset = utc_offset(utc_offset_minutes).unwrap_or_else(|e| {
            warn!(error = %e, "using UTC for sun estimate");
            Duration::zero()
        });

        let hour = input.hour.min(23);
        let lags = date
            .and_hms_opt(hour, 0, 0)
            .map(|t| LagFeatures::from_history(history.as_ref(), t))
            .unwrap_or_default();
        let input = HourInput { hour, ..input.clone() };
        let mut forecast = self.predict_hour(date, &input, lags, &snapshot, &ctx, offset);
        forecast.kwh = clamp_kwh(forecast.kwh, self.config.hourly_ceiling_kwh());
        forecast
    }
}

fn numeric_backend_available() -> bool {
    cfg!(feature = "linalg")
}

fn load_or_default<T: Default>(loaded: Result<Option<T>, StoreError>, what: &str) -> Result<T, EngineError> {
    match loaded {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(e) if e.is_recoverable() => {
            warn!(error = %e, state = what, "persisted state unusable, reverting to defaults");
            Ok(T::default())
        }
        Err(e) => Err(EngineError::InitializationFailed(format!("{what}: {e}"))),
    }
}

fn utc_offset(minutes: i32) -> Result<Duration, ForecastError> {
    // Real offsets stay within ±14 h
    if minutes.unsigned_abs() > 14 * 60 {
        return Err(ForecastError::InvalidOffset(minutes));
    }
    Ok(Duration::minutes(i64::from(minutes)))
}

fn clamp_kwh(value: f64, ceiling: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, ceiling.max(0.0))
    } else {
        0.0
    }
}

/// kWh-weighted mean confidence; plain mean when nothing is produced
fn overall_confidence(hours: &[&HourlyForecast]) -> f64 {
    let total: f64 = hours.iter().map(|h| h.kwh).sum();
    if total > 0.0 {
        hours.iter().map(|h| h.confidence * h.kwh).sum::<f64>() / total
    } else if hours.is_empty() {
        0.0
    } else {
        hours.iter().map(|h| h.confidence).sum::<f64>() / hours.len() as f64
    }
}

/// Method that produced most of the energy, ties broken by method rank
fn dominant_method(hours: &[&HourlyForecast]) -> ForecastMethod {
    let mut by_method: HashMap<ForecastMethod, f64> = HashMap::new();
    for hour in hours {
        *by_method.entry(hour.method).or_default() += hour.kwh;
    }
    by_method
        .into_iter()
        .max_by(|(a_method, a_kwh), (b_method, b_kwh)| {
            a_kwh
                .total_cmp(b_kwh)
                .then_with(|| b_method.rank().cmp(&a_method.rank()))
        })
        .map_or(ForecastMethod::FallbackEmpty, |(method, _)| method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AstronomySnapshot, WeatherSnapshot};
    use crate::repo::{InMemoryStateStore, VecRecordSource};

    async fn orchestrator() -> ForecastOrchestrator {
        ForecastOrchestrator::initialize(
            Config::default(),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(VecRecordSource::default()),
        )
        .await
        .unwrap()
    }

    fn hour(hour: u32, cloud: f64, ghi: Option<f64>, elevation: f64) -> HourInput {
        HourInput {
            hour,
            weather: WeatherSnapshot {
                cloud_cover_percent: Some(cloud),
                temperature: Some(20.0),
                ghi,
                ..Default::default()
            },
            sensor: None,
            astronomy: Some(AstronomySnapshot {
                sun_elevation_deg: Some(elevation),
                sun_azimuth_deg: Some(180.0),
                ..Default::default()
            }),
        }
    }

    fn june_day(date: NaiveDate, with_irradiance: bool) -> DayInput {
        DayInput {
            date,
            hours: (0..24)
                .map(|h| {
                    let elevation = 60.0 * ((h as f64 - 5.0) * std::f64::consts::PI / 16.0).sin();
                    let ghi = with_irradiance.then(|| (elevation.max(0.0) * 14.0).min(900.0));
                    hour(h, 20.0, ghi, elevation)
                })
                .collect(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    #[tokio::test]
    async fn test_empty_request_is_fallback_empty() {
        let engine = orchestrator().await;
        let result = engine.forecast(&ForecastRequest::default());
        assert!(result.is_degraded());
        assert_eq!(result.today_kwh, 0.0);
    }

    #[tokio::test]
    async fn test_duplicate_days_are_rejected() {
        let engine = orchestrator().await;
        let request = ForecastRequest {
            days: vec![june_day(date(10), true), june_day(date(10), true)],
            utc_offset_minutes: 120,
        };
        assert!(engine.forecast(&request).is_degraded());
    }

    #[tokio::test]
    async fn test_physics_forecast_has_daylight_shape() {
        let engine = orchestrator().await;
        let request = ForecastRequest {
            days: vec![june_day(date(10), true), june_day(date(11), true), june_day(date(12), false)],
            utc_offset_minutes: 120,
        };
        let result = engine.forecast(&request);

        assert_eq!(result.method, ForecastMethod::Physics);
        assert!(result.today_kwh > 5.0, "today {}", result.today_kwh);
        assert!((result.today_kwh - result.tomorrow_kwh).abs() < 1e-9);
        assert_eq!(result.hourly.len(), 72);
        assert!(!result.safeguard_applied);
        assert_eq!(result.today_kwh, result.today_kwh_raw);

        let best = result.best_hour.unwrap();
        assert!((11..=15).contains(&best), "best hour {best}");
        for h in result.hours_for(date(10)).filter(|h| h.hour < 4 || h.hour > 21) {
            assert_eq!(h.kwh, 0.0, "hour {}", h.hour);
        }
        let ceiling = engine.config().hourly_ceiling_kwh();
        assert!(result.hourly.iter().all(|h| h.kwh >= 0.0 && h.kwh <= ceiling));

        // No irradiance: physics unavailable, the chain's fallback takes over
        assert!(result.hours_for(date(12)).all(|h| h.method == ForecastMethod::SimpleFallback));
        assert!(result.day_after_kwh > 0.0);
    }

    #[test]
    fn test_dominant_method_prefers_energy_then_rank() {
        let make = |method, kwh| HourlyForecast {
            date: date(1),
            hour: 12,
            kwh,
            method,
            confidence: 0.5,
        };
        let a = make(ForecastMethod::Physics, 2.0);
        let b = make(ForecastMethod::SimpleFallback, 3.0);
        assert_eq!(dominant_method(&[&a, &b]), ForecastMethod::SimpleFallback);

        let c = make(ForecastMethod::Hybrid, 2.0);
        assert_eq!(dominant_method(&[&a, &c]), ForecastMethod::Hybrid);
        assert_eq!(dominant_method(&[]), ForecastMethod::FallbackEmpty);
    }

    #[test]
    fn test_overall_confidence_is_energy_weighted() {
        let make = |kwh, confidence| HourlyForecast {
            date: date(1),
            hour: 12,
            kwh,
            method: ForecastMethod::Physics,
            confidence,
        };
        let a = make(3.0, 0.9);
        let b = make(1.0, 0.3);
        assert!((overall_confidence(&[&a, &b]) - 0.75).abs() < 1e-12);
        let night = make(0.0, 0.3);
        assert!((overall_confidence(&[&night]) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_offset_bounds() {
        assert!(utc_offset(14 * 60).is_ok());
        assert!(utc_offset(-15 * 60).is_err());
        assert!(utc_offset(i32::MIN).is_err());
        assert!(utc_offset(i32::MAX).is_err());
    }
}
