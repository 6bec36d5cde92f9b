use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::weather::{AstronomySnapshot, SensorSnapshot, WeatherSnapshot};

/// Which path produced a forecast value
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ForecastMethod {
    /// Panel-group physics with calibration
    Physics,
    /// Learned linear model
    MlModel,
    /// Historical hourly medians
    HourlyProfile,
    /// Closed-form daylight curve
    SimpleFallback,
    /// Confidence-weighted blend of physics and learned model
    Hybrid,
    /// Nothing usable could be produced
    FallbackEmpty,
}

impl ForecastMethod {
    /// Tie-break order when two methods account for the same energy
    pub fn rank(&self) -> u8 {
        match self {
            Self::Hybrid => 0,
            Self::MlModel => 1,
            Self::Physics => 2,
            Self::HourlyProfile => 3,
            Self::SimpleFallback => 4,
            Self::FallbackEmpty => 5,
        }
    }
}

/// Inputs for one local hour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourInput {
    pub hour: u32,
    #[serde(default)]
    pub weather: WeatherSnapshot,
    #[serde(default)]
    pub sensor: Option<SensorSnapshot>,
    #[serde(default)]
    pub astronomy: Option<AstronomySnapshot>,
}

/// Inputs for one local day. Hours not listed are treated as night.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayInput {
    pub date: NaiveDate,
    pub hours: Vec<HourInput>,
}

/// A forecast request: today first, then tomorrow and the day after
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub days: Vec<DayInput>,
    /// Offset of local time from UTC, used to estimate the sun position
    /// for hours without astronomy data
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub date: NaiveDate,
    pub hour: u32,
    pub kwh: f64,
    pub method: ForecastMethod,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub today_kwh: f64,
    pub tomorrow_kwh: f64,
    pub day_after_kwh: f64,
    /// Today's total before the safeguard cap
    pub today_kwh_raw: f64,
    pub safeguard_applied: bool,
    pub hourly: Vec<HourlyForecast>,
    pub best_hour: Option<u32>,
    pub best_hour_kwh: Option<f64>,
    /// Overall confidence, 0.0 - 1.0
    pub confidence: f64,
    pub method: ForecastMethod,
    pub model_accuracy: Option<f64>,
}

impl ForecastResult {
    /// Zeroed result handed out when nothing could be computed
    pub fn fallback_empty(model_accuracy: Option<f64>) -> Self {
        Self {
            today_kwh: 0.0,
            tomorrow_kwh: 0.0,
            day_after_kwh: 0.0,
            today_kwh_raw: 0.0,
            safeguard_applied: false,
            hourly: Vec::new(),
            best_hour: None,
            best_hour_kwh: None,
            confidence: 0.0,
            method: ForecastMethod::FallbackEmpty,
            model_accuracy,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.method == ForecastMethod::FallbackEmpty
    }

    pub fn hours_for(&self, date: NaiveDate) -> impl Iterator<Item = &HourlyForecast> {
        self.hourly.iter().filter(move |h| h.date == date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    pub success: bool,
    pub accuracy: Option<f64>,
    pub samples_used: usize,
    pub duration_secs: f64,
    pub feature_count: usize,
    pub lambda: Option<f64>,
    pub error_message: Option<String>,
}

impl TrainingResult {
    pub fn failed(message: impl Into<String>, samples_used: usize, duration_secs: f64) -> Self {
        Self {
            success: false,
            accuracy: None,
            samples_used,
            duration_secs,
            feature_count: 0,
            lambda: None,
            error_message: Some(message.into()),
        }
    }
}

/// One group lifted out of structural miscalibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescuedGroup {
    pub group: String,
    pub samples: usize,
    pub days: usize,
    pub factor: f64,
    /// Configured capacity scaled by the rescue factor; advisory only
    pub implied_capacity_kwp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub success: bool,
    pub groups_calibrated: usize,
    pub total_samples: usize,
    pub avg_correction_factor: f64,
    pub message: String,
    #[serde(default)]
    pub rescued: Vec<RescuedGroup>,
}

impl CalibrationResult {
    pub fn nothing_to_do(message: impl Into<String>) -> Self {
        Self {
            success: false,
            groups_calibrated: 0,
            total_samples: 0,
            avg_correction_factor: 1.0,
            message: message.into(),
            rescued: Vec::new(),
        }
    }
}
