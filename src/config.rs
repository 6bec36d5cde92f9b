use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::physics::{PanelGroup, DEFAULT_ALBEDO, DEFAULT_SYSTEM_EFFICIENCY};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "SOLAR_FORECAST__";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub site: SiteConfig,
    #[validate(nested)]
    pub calibration: CalibrationConfig,
    #[validate(nested)]
    pub training: TrainingConfig,
    #[validate(nested)]
    pub forecast: ForecastConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SiteConfig {
    /// Total nominal capacity (kWp); used for the implicit group and the
    /// hourly ceiling
    #[validate(range(exclusive_min = 0.0))]
    pub capacity_kwp: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub system_efficiency: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub albedo: f64,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    #[validate(nested)]
    pub panel_groups: Vec<PanelGroup>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            capacity_kwp: 5.0,
            system_efficiency: DEFAULT_SYSTEM_EFFICIENCY,
            albedo: DEFAULT_ALBEDO,
            latitude: 51.0,
            longitude: 10.0,
            panel_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_calibration_bounds"))]
pub struct CalibrationConfig {
    #[validate(range(exclusive_min = 0.0))]
    pub normal_min: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub normal_max: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub rescue_max: f64,
    /// Daily actual/physics ratio that counts as structural miscalibration
    pub rescue_ratio_threshold: f64,
    #[validate(range(min = 1))]
    pub rescue_min_days: usize,
    #[validate(range(min = 1, max = 3650))]
    pub rescue_lookback_days: i64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub alpha_initial: f64,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub alpha_stable: f64,
    /// Samples after which a bucket switches to `alpha_stable`
    pub stable_after_samples: u32,
    pub low_sun_elevation_deg: f64,
    /// Physics predictions below this are too small to form a ratio
    #[validate(range(min = 0.0))]
    pub min_predicted_kwh: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            normal_min: 0.3,
            normal_max: 3.0,
            rescue_max: 50.0,
            rescue_ratio_threshold: 10.0,
            rescue_min_days: 2,
            rescue_lookback_days: 14,
            alpha_initial: 0.3,
            alpha_stable: 0.1,
            stable_after_samples: 20,
            low_sun_elevation_deg: 10.0,
            min_predicted_kwh: 0.05,
        }
    }
}

fn validate_calibration_bounds(cfg: &CalibrationConfig) -> Result<(), ValidationError> {
    if cfg.normal_min >= cfg.normal_max {
        return Err(ValidationError::new("normal_min must be below normal_max"));
    }
    if cfg.rescue_max < cfg.normal_max {
        return Err(ValidationError::new("rescue_max must not be below normal_max"));
    }
    if cfg.rescue_ratio_threshold <= cfg.normal_max {
        return Err(ValidationError::new(
            "rescue_ratio_threshold must exceed normal_max",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrainingConfig {
    /// Minimum usable records before a training run may replace the model
    #[validate(range(min = 5))]
    pub min_samples: usize,
    /// Days of records requested from the record source
    #[validate(range(min = 1))]
    pub history_days: u32,
    #[validate(length(min = 1))]
    pub lambda_candidates: Vec<f64>,
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub validation_split: f64,
    #[validate(range(min = 0.0))]
    pub default_lambda: f64,
    /// Below this accuracy a trained model is reported as degraded
    #[validate(range(min = 0.0, max = 1.0))]
    pub degraded_accuracy: f64,
    #[validate(range(min = 1, max = 3650))]
    pub stale_after_days: i64,
    #[validate(length(min = 1))]
    pub sweep_learning_rates: Vec<f64>,
    #[validate(length(min = 1))]
    pub sweep_max_iterations: Vec<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            history_days: 60,
            lambda_candidates: vec![0.001, 0.01, 0.1, 1.0, 10.0, 100.0],
            validation_split: 0.2,
            default_lambda: 0.1,
            degraded_accuracy: 0.3,
            stale_after_days: 14,
            sweep_learning_rates: vec![0.001, 0.01, 0.05, 0.1],
            sweep_max_iterations: vec![100, 500, 1000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ForecastConfig {
    /// Hourly ceiling as a multiple of capacity (kWh per kWp)
    #[validate(range(exclusive_min = 0.0))]
    pub max_hourly_factor: f64,
    /// Today's forecast may not exceed the best recent day by more than this
    #[validate(range(min = 1.0))]
    pub safeguard_ratio: f64,
    pub safeguard_min_history_days: usize,
    #[validate(range(min = 1, max = 3650))]
    pub safeguard_lookback_days: i64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub physics_confidence: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub profile_confidence: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub fallback_confidence: f64,
    /// Profile strategy needs more than this many samples
    pub min_profile_samples: usize,
    /// Peak of the fallback curve as a fraction of capacity
    #[validate(range(exclusive_min = 0.0, max = 1.2))]
    pub fallback_peak_fraction: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            max_hourly_factor: 1.2,
            safeguard_ratio: 1.5,
            safeguard_min_history_days: 3,
            safeguard_lookback_days: 14,
            physics_confidence: 0.7,
            profile_confidence: 0.6,
            fallback_confidence: 0.3,
            min_profile_samples: 10,
            fallback_peak_fraction: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Training records file inside `data_dir`, used by the CLI record source
    pub records_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            records_file: "training_records.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub json: bool,
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: "info,solar_forecast_engine=info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (if present), then `SOLAR_FORECAST__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate().context("configuration out of range")?;
        Ok(config)
    }

    /// Ceiling for any single hour (kWh)
    pub fn hourly_ceiling_kwh(&self) -> f64 {
        self.site.capacity_kwp * self.forecast.max_hourly_factor
    }
}
