//! Prediction strategies in fixed priority order
//!
//! Each strategy clamps its own output to the hourly ceiling. The chain
//! swallows strategy errors and moves on; the fallback has no error path, so
//! a value is always produced.

use std::f64::consts::PI;

use tracing::debug;

use super::features::DEFAULT_SEASONAL_FACTOR;
use super::models::{HourlyProfile, LearnedWeights, WeightsError};
use super::scaler::{FeatureScaler, ScalerError};
use super::FeatureVector;
use crate::config::ForecastConfig;
use crate::domain::ForecastMethod;

const FALLBACK_FIRST_HOUR: u32 = 6;
const FALLBACK_LAST_HOUR: u32 = 20;
const UNKNOWN_ACCURACY_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyError {
    #[error("Strategy unavailable: {0}")]
    Unavailable(&'static str),
    #[error("Scaling failed: {0}")]
    Scaling(#[from] ScalerError),
    #[error("Learned model failed: {0}")]
    Weights(#[from] WeightsError),
}

/// One hour's features as produced by the feature engineer (unscaled)
#[derive(Debug, Clone)]
pub struct StrategyInput {
    pub hour: u32,
    pub raw: FeatureVector,
}

impl StrategyInput {
    fn feature(&self, name: &str, default: f64) -> f64 {
        self.raw.get(name).filter(|v| v.is_finite()).unwrap_or(default)
    }
}

/// Committed model state the strategies read from
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub weights: &'a LearnedWeights,
    pub scaler: &'a FeatureScaler,
    pub profile: &'a HourlyProfile,
    pub capacity_kwp: f64,
    pub config: &'a ForecastConfig,
    /// False once the linear-algebra backend is known to be missing
    pub learned_enabled: bool,
}

impl StrategyContext<'_> {
    pub fn ceiling_kwh(&self) -> f64 {
        (self.capacity_kwp * self.config.max_hourly_factor).max(0.0)
    }

    fn clamp(&self, value: f64) -> f64 {
        if value.is_finite() {
            value.clamp(0.0, self.ceiling_kwh())
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyPrediction {
    pub kwh: f64,
    pub confidence: f64,
    pub method: ForecastMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PredictionStrategy {
    LearnedModel,
    Profile,
    Fallback,
}

impl PredictionStrategy {
    pub fn method(&self) -> ForecastMethod {
        match self {
            Self::LearnedModel => ForecastMethod::MlModel,
            Self::Profile => ForecastMethod::HourlyProfile,
            Self::Fallback => ForecastMethod::SimpleFallback,
        }
    }

    pub fn is_available(&self, ctx: &StrategyContext<'_>) -> bool {
        match self {
            Self::LearnedModel => ctx.learned_enabled && ctx.weights.is_trained(),
            Self::Profile => ctx.profile.samples_count > ctx.config.min_profile_samples,
            Self::Fallback => true,
        }
    }

    pub fn predict(
        &self,
        input: &StrategyInput,
        ctx: &StrategyContext<'_>,
    ) -> Result<StrategyPrediction, StrategyError> {
        if !self.is_available(ctx) {
            return Err(StrategyError::Unavailable(match self {
                Self::LearnedModel => "no trained weights",
                Self::Profile => "not enough profile samples",
                Self::Fallback => "fallback disabled",
            }));
        }
        match self {
            Self::LearnedModel => predict_learned(input, ctx),
            Self::Profile => Ok(predict_profile(input, ctx)),
            Self::Fallback => Ok(predict_fallback(input, ctx)),
        }
    }
}

fn predict_learned(input: &StrategyInput, ctx: &StrategyContext<'_>) -> Result<StrategyPrediction, StrategyError> {
    let scaled = ctx.scaler.transform(&input.raw)?;
    if scaled.degraded {
        debug!(hour = input.hour, "scaler not fitted, using raw features");
    }
    let value = ctx.weights.predict(&scaled.vector)?;

    let confidence = match ctx.weights.accuracy {
        Some(accuracy) => {
            let history_boost = if input.feature("production_yesterday", 0.0) > 0.0 {
                1.1
            } else {
                1.0
            };
            let stability = 0.8 + 0.2 * input.feature("weather_trend", 0.5).clamp(0.0, 1.0);
            (accuracy * history_boost * stability).clamp(0.0, 1.0)
        }
        None => UNKNOWN_ACCURACY_CONFIDENCE,
    };

    Ok(StrategyPrediction {
        kwh: ctx.clamp(value),
        confidence,
        method: ForecastMethod::MlModel,
    })
}

fn predict_profile(input: &StrategyInput, ctx: &StrategyContext<'_>) -> StrategyPrediction {
    let cloudiness = input.feature("cloudiness", 50.0).clamp(0.0, 100.0);
    let seasonal = input.feature("seasonal_factor", DEFAULT_SEASONAL_FACTOR);
    let value = ctx.profile.median_for(input.hour) * (100.0 - cloudiness) / 100.0 * (0.5 + seasonal);

    StrategyPrediction {
        kwh: ctx.clamp(value),
        confidence: ctx.config.profile_confidence,
        method: ForecastMethod::HourlyProfile,
    }
}

fn predict_fallback(input: &StrategyInput, ctx: &StrategyContext<'_>) -> StrategyPrediction {
    let hour = input.hour;
    let value = if !(FALLBACK_FIRST_HOUR..=FALLBACK_LAST_HOUR).contains(&hour) {
        0.0
    } else {
        let cloudiness = input.feature("cloudiness", 50.0).clamp(0.0, 100.0);
        let seasonal = input.feature("seasonal_factor", DEFAULT_SEASONAL_FACTOR);
        let shape = ((hour - FALLBACK_FIRST_HOUR) as f64 * PI / 14.0).sin();
        ctx.capacity_kwp
            * ctx.config.fallback_peak_fraction
            * shape
            * (1.0 - cloudiness / 100.0)
            * seasonal
            * ctx.weights.correction_factor
    };

    StrategyPrediction {
        kwh: ctx.clamp(value),
        confidence: ctx.config.fallback_confidence,
        method: ForecastMethod::SimpleFallback,
    }
}

/// Ordered chain; the first strategy that is available and succeeds wins
#[derive(Debug, Clone)]
pub struct StrategyChain {
    strategies: Vec<PredictionStrategy>,
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self {
            strategies: vec![
                PredictionStrategy::LearnedModel,
                PredictionStrategy::Profile,
                PredictionStrategy::Fallback,
            ],
        }
    }
}

impl StrategyChain {
    pub fn strategies(&self) -> &[PredictionStrategy] {
        &self.strategies
    }

    pub fn predict(&self, input: &StrategyInput, ctx: &StrategyContext<'_>) -> StrategyPrediction {
        for strategy in &self.strategies {
            if !strategy.is_available(ctx) {
                continue;
            }
            match strategy.predict(input, ctx) {
                Ok(prediction) => return prediction,
                Err(e) => {
                    debug!(strategy = %strategy, hour = input.hour, error = %e, "strategy failed, trying next");
                }
            }
        }
        predict_fallback(input, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizedWeather;
    use crate::ml::features::{FeatureEngineer, LagFeatures};
    use chrono::{NaiveDate, Utc};
    use rstest::rstest;

    fn input(hour: u32, cloud: f64, production_yesterday: f64) -> StrategyInput {
        let weather = NormalizedWeather {
            cloud_cover_percent: cloud,
            wind_speed: 0.0,
            ..Default::default()
        };
        let time = NaiveDate::from_ymd_opt(2024, 6, 20)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        let lags = LagFeatures {
            production_yesterday: Some(production_yesterday),
            production_last_hour: None,
        };
        StrategyInput {
            hour,
            raw: FeatureEngineer::default().extract(&weather, time, lags),
        }
    }

    fn trained_weights(bias: f64, accuracy: Option<f64>) -> LearnedWeights {
        let names = FeatureEngineer::default().feature_names();
        LearnedWeights {
            weights: names.iter().map(|n| (n.clone(), 0.0)).collect(),
            bias,
            feature_names: names,
            accuracy,
            last_trained: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn profile(samples: usize) -> HourlyProfile {
        HourlyProfile {
            hourly_medians: [2.0; 24],
            samples_count: samples,
            confidence: 0.5,
            built_at: None,
        }
    }

    struct Fixture {
        weights: LearnedWeights,
        scaler: FeatureScaler,
        profile: HourlyProfile,
        config: ForecastConfig,
    }

    impl Fixture {
        fn new(weights: LearnedWeights, profile: HourlyProfile) -> Self {
            Self {
                weights,
                scaler: FeatureScaler::default(),
                profile,
                config: ForecastConfig::default(),
            }
        }

        fn ctx(&self) -> StrategyContext<'_> {
            StrategyContext {
                weights: &self.weights,
                scaler: &self.scaler,
                profile: &self.profile,
                capacity_kwp: 5.0,
                config: &self.config,
                learned_enabled: true,
            }
        }
    }

    #[test]
    fn test_learned_model_wins_when_trained() {
        let fixture = Fixture::new(trained_weights(2.0, Some(0.8)), profile(100));
        let prediction = StrategyChain::default().predict(&input(12, 0.0, 0.0), &fixture.ctx());
        assert_eq!(prediction.method, ForecastMethod::MlModel);
        assert_eq!(prediction.kwh, 2.0);
        assert!((prediction.confidence - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_untrained_model_falls_to_profile() {
        let fixture = Fixture::new(LearnedWeights::default(), profile(100));
        let prediction = StrategyChain::default().predict(&input(12, 50.0, 0.0), &fixture.ctx());
        assert_eq!(prediction.method, ForecastMethod::HourlyProfile);
        assert_eq!(prediction.confidence, 0.6);
        // 2.0 × 0.5 × (0.5 + 1.0)
        assert!((prediction.kwh - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_broken_model_is_skipped_not_propagated() {
        let mut weights = trained_weights(0.0, Some(0.9));
        weights.feature_names.push("not_a_feature".to_string());
        weights.weights.insert("not_a_feature".to_string(), 1.0);
        let fixture = Fixture::new(weights, profile(3));

        let strategy_err = PredictionStrategy::LearnedModel.predict(&input(12, 0.0, 0.0), &fixture.ctx());
        assert!(matches!(strategy_err, Err(StrategyError::Weights(_))));

        let prediction = StrategyChain::default().predict(&input(12, 0.0, 0.0), &fixture.ctx());
        assert_eq!(prediction.method, ForecastMethod::SimpleFallback);
        assert!(prediction.kwh > 0.0);
    }

    #[test]
    fn test_disabled_backend_skips_learned_model() {
        let fixture = Fixture::new(trained_weights(2.0, Some(0.9)), profile(0));
        let mut ctx = fixture.ctx();
        ctx.learned_enabled = false;
        let prediction = StrategyChain::default().predict(&input(12, 0.0, 0.0), &ctx);
        assert_eq!(prediction.method, ForecastMethod::SimpleFallback);
    }

    #[test]
    fn test_outputs_are_clamped_to_ceiling() {
        let fixture = Fixture::new(trained_weights(100.0, Some(0.9)), profile(0));
        let prediction = StrategyChain::default().predict(&input(12, 0.0, 0.0), &fixture.ctx());
        assert_eq!(prediction.kwh, 6.0);

        let fixture = Fixture::new(trained_weights(-3.0, Some(0.9)), profile(0));
        let prediction = StrategyChain::default().predict(&input(12, 0.0, 0.0), &fixture.ctx());
        assert_eq!(prediction.kwh, 0.0);
    }

    #[rstest]
    #[case(Some(0.8), 0.0, 0.0, 0.8)]
    #[case(Some(0.8), 5.0, 0.0, 0.88)]
    #[case(Some(0.8), 0.0, 100.0, 0.8 * (0.8 + 0.2 * 0.3))]
    #[case(Some(1.0), 5.0, 0.0, 1.0)]
    #[case(None, 5.0, 0.0, 0.5)]
    fn test_learned_confidence(
        #[case] accuracy: Option<f64>,
        #[case] production_yesterday: f64,
        #[case] cloud: f64,
        #[case] expected: f64,
    ) {
        let fixture = Fixture::new(trained_weights(1.0, accuracy), profile(0));
        let prediction = PredictionStrategy::LearnedModel
            .predict(&input(12, cloud, production_yesterday), &fixture.ctx())
            .unwrap();
        assert!((prediction.confidence - expected).abs() < 1e-9, "{}", prediction.confidence);
    }

    #[rstest]
    #[case(3, 0.0)]
    #[case(5, 0.0)]
    #[case(21, 0.0)]
    fn test_fallback_is_zero_at_night(#[case] hour: u32, #[case] expected: f64) {
        let fixture = Fixture::new(LearnedWeights::default(), profile(0));
        let prediction = PredictionStrategy::Fallback
            .predict(&input(hour, 0.0, 0.0), &fixture.ctx())
            .unwrap();
        assert_eq!(prediction.kwh, expected);
        assert_eq!(prediction.confidence, 0.3);
    }

    #[test]
    fn test_fallback_peaks_at_midday_and_uses_correction() {
        let mut fixture = Fixture::new(LearnedWeights::default(), profile(0));
        let noon = PredictionStrategy::Fallback.predict(&input(13, 0.0, 0.0), &fixture.ctx()).unwrap();
        let morning = PredictionStrategy::Fallback.predict(&input(8, 0.0, 0.0), &fixture.ctx()).unwrap();
        // 5 kWp × 0.75 × sin(π/2) × 1 × seasonal(≈1)
        assert!((noon.kwh - 3.75).abs() < 0.01, "{}", noon.kwh);
        assert!(morning.kwh < noon.kwh);

        fixture.weights.set_correction_factor(1.2);
        let corrected = PredictionStrategy::Fallback.predict(&input(13, 0.0, 0.0), &fixture.ctx()).unwrap();
        assert!((corrected.kwh - noon.kwh * 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_features_still_yield_a_value() {
        let fixture = Fixture::new(trained_weights(1.0, Some(0.9)), profile(0));
        let mut bad = input(12, 0.0, 0.0);
        bad.raw.features[0] = f64::NAN;
        bad.raw.features[2] = f64::NAN;
        let prediction = StrategyChain::default().predict(&bad, &fixture.ctx());
        assert!(prediction.kwh.is_finite());
        assert_eq!(prediction.method, ForecastMethod::SimpleFallback);
    }
}
