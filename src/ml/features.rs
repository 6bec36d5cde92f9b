//! Feature engineering for the learned model
//!
//! The feature set is fixed and its order is load-bearing: weights are stored
//! by name, but the scaler statistics and the solver work positionally.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use std::f64::consts::PI;

use super::FeatureVector;
use crate::domain::{NormalizedWeather, TrainingRecord};

pub const BASE_FEATURES: [&str; 9] = [
    "temperature",
    "humidity",
    "cloudiness",
    "wind_speed",
    "hour_of_day",
    "seasonal_factor",
    "weather_trend",
    "production_yesterday",
    "production_last_hour",
];

pub const POLYNOMIAL_FEATURES: [&str; 4] = [
    "temperature_sq",
    "cloudiness_sq",
    "hour_of_day_sq",
    "seasonal_factor_sq",
];

pub const INTERACTION_FEATURES: [&str; 5] = [
    "cloudiness_x_hour",
    "temperature_x_seasonal",
    "humidity_x_cloudiness",
    "wind_x_hour",
    "weather_trend_x_seasonal",
];

pub const DEFAULT_SEASONAL_FACTOR: f64 = 0.75;
const SUMMER_SOLSTICE_DOY: f64 = 172.0;

/// Seasonal weight: 1.0 at the summer solstice, 0.0 half a year later
pub fn seasonal_factor(day_of_year: u32) -> f64 {
    if day_of_year == 0 || day_of_year > 366 {
        return DEFAULT_SEASONAL_FACTOR;
    }
    0.5 + 0.5 * ((day_of_year as f64 - SUMMER_SOLSTICE_DOY) * 2.0 * PI / 365.0).cos()
}

/// Weather stability score in [0, 1]: clear and calm is 1.0
pub fn weather_trend(cloud_cover_percent: f64, wind_speed: f64) -> f64 {
    let cloud_score = 1.0 - cloud_cover_percent.clamp(0.0, 100.0) / 100.0;
    let wind_factor = (1.0 - wind_speed.max(0.0) / 20.0).max(0.0);
    cloud_score * 0.7 + wind_factor * 0.3
}

/// Lookup of past production for lag features
pub trait ProductionHistory {
    fn daily_total(&self, date: NaiveDate) -> Option<f64>;
    fn hourly(&self, date: NaiveDate, hour: u32) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LagFeatures {
    pub production_yesterday: Option<f64>,
    pub production_last_hour: Option<f64>,
}

impl LagFeatures {
    pub fn from_history(history: &dyn ProductionHistory, time: NaiveDateTime) -> Self {
        let date = time.date();
        let previous_hour = time - Duration::hours(1);
        Self {
            production_yesterday: date.pred_opt().and_then(|d| history.daily_total(d)),
            production_last_hour: history.hourly(previous_hour.date(), previous_hour.hour()),
        }
    }
}

/// Design matrix and targets ready for the trainer
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub features: Vec<FeatureVector>,
    pub targets: Vec<f64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureEngineer {
    polynomial: bool,
    interactions: bool,
}

impl Default for FeatureEngineer {
    fn default() -> Self {
        Self {
            polynomial: true,
            interactions: true,
        }
    }
}

impl FeatureEngineer {
    /// Only the nine base features
    pub fn base_only() -> Self {
        Self {
            polynomial: false,
            interactions: false,
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<&str> = BASE_FEATURES.to_vec();
        if self.polynomial {
            names.extend(POLYNOMIAL_FEATURES);
        }
        if self.interactions {
            names.extend(INTERACTION_FEATURES);
        }
        names.into_iter().map(String::from).collect()
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names().len()
    }

    pub fn extract(&self, weather: &NormalizedWeather, time: NaiveDateTime, lags: LagFeatures) -> FeatureVector {
        let temperature = weather.temperature;
        let humidity = weather.humidity;
        let cloudiness = weather.cloud_cover_percent;
        let wind_speed = weather.wind_speed;
        let hour = time.hour() as f64;
        let seasonal = seasonal_factor(time.ordinal());
        let trend = weather_trend(cloudiness, wind_speed);

        let mut values = vec![
            temperature,
            humidity,
            cloudiness,
            wind_speed,
            hour,
            seasonal,
            trend,
            lags.production_yesterday.filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0),
            lags.production_last_hour.filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0),
        ];

        if self.polynomial {
            values.extend([
                temperature.powi(2),
                cloudiness.powi(2),
                hour.powi(2),
                seasonal.powi(2),
            ]);
        }
        if self.interactions {
            values.extend([
                cloudiness * hour,
                temperature * seasonal,
                humidity * cloudiness,
                wind_speed * hour,
                trend * seasonal,
            ]);
        }

        FeatureVector {
            features: values,
            feature_names: self.feature_names(),
        }
    }

    /// Features and targets for every usable record, in record order
    pub fn build_training_set(&self, records: &[TrainingRecord], history: &dyn ProductionHistory) -> TrainingSet {
        let mut set = TrainingSet::default();
        for record in records.iter().filter(|r| r.is_usable()) {
            let time = record.timestamp.naive_local();
            let lags = LagFeatures::from_history(history, time);
            set.features.push(self.extract(&record.normalized_weather(), time, lags));
            set.targets.push(record.actual_kwh);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedHistory {
        daily: HashMap<NaiveDate, f64>,
    }

    impl ProductionHistory for FixedHistory {
        fn daily_total(&self, date: NaiveDate) -> Option<f64> {
            self.daily.get(&date).copied()
        }

        fn hourly(&self, _date: NaiveDate, hour: u32) -> Option<f64> {
            (hour == 11).then_some(1.5)
        }
    }

    fn noon(month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, month, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_seasonal_factor_peaks_at_solstice() {
        assert!((seasonal_factor(172) - 1.0).abs() < 1e-12);
        assert!(seasonal_factor(355) < 0.01);
        assert_eq!(seasonal_factor(0), DEFAULT_SEASONAL_FACTOR);
    }

    #[test]
    fn test_weather_trend_bounds() {
        assert!((weather_trend(0.0, 0.0) - 1.0).abs() < 1e-12);
        assert_eq!(weather_trend(100.0, 30.0), 0.0);
    }

    #[test]
    fn test_feature_order_is_stable() {
        let engineer = FeatureEngineer::default();
        let names = engineer.feature_names();
        assert_eq!(names.len(), 18);
        assert_eq!(names[0], "temperature");
        assert_eq!(names[8], "production_last_hour");
        assert_eq!(names[17], "weather_trend_x_seasonal");
        assert_eq!(FeatureEngineer::base_only().feature_count(), 9);
    }

    #[test]
    fn test_missing_inputs_use_neutral_defaults() {
        let engineer = FeatureEngineer::default();
        let fv = engineer.extract(&NormalizedWeather::default(), noon(6, 20), LagFeatures::default());
        assert_eq!(fv.get("temperature"), Some(15.0));
        assert_eq!(fv.get("humidity"), Some(60.0));
        assert_eq!(fv.get("cloudiness"), Some(50.0));
        assert_eq!(fv.get("wind_speed"), Some(5.0));
        assert_eq!(fv.get("production_yesterday"), Some(0.0));
        assert!(fv.features.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_lags_come_from_history() {
        let time = noon(6, 20);
        let history = FixedHistory {
            daily: HashMap::from([(time.date().pred_opt().unwrap(), 21.0)]),
        };
        let lags = LagFeatures::from_history(&history, time);
        assert_eq!(lags.production_yesterday, Some(21.0));
        assert_eq!(lags.production_last_hour, Some(1.5));

        let fv = FeatureEngineer::default().extract(&NormalizedWeather::default(), time, lags);
        assert_eq!(fv.get("production_yesterday"), Some(21.0));
        assert_eq!(fv.get("cloudiness_x_hour"), Some(50.0 * 12.0));
    }
}
