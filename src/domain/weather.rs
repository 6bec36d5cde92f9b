//! Hourly input snapshots
//!
//! Weather, sensor and astronomy inputs arrive with every field optional.
//! [`NormalizedWeather::from_snapshots`] is the single place where neutral
//! defaults are filled in, so calculation code downstream never checks for
//! presence.

use chrono::{DateTime, FixedOffset, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::physics::{Irradiance, SunPosition};

pub const DEFAULT_TEMPERATURE_C: f64 = 15.0;
pub const DEFAULT_HUMIDITY_PERCENT: f64 = 60.0;
pub const DEFAULT_CLOUD_COVER_PERCENT: f64 = 50.0;
pub const DEFAULT_WIND_SPEED_MS: f64 = 5.0;

/// Per-hour weather as delivered by the weather port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSnapshot {
    /// Ambient temperature (°C)
    pub temperature: Option<f64>,
    /// Relative humidity (%)
    pub humidity: Option<f64>,
    /// Cloud cover (%)
    pub cloud_cover_percent: Option<f64>,
    /// Wind speed (m/s)
    pub wind_speed: Option<f64>,
    /// Precipitation (mm)
    pub precipitation: Option<f64>,
    /// Global horizontal irradiance (W/m²)
    pub ghi: Option<f64>,
    /// Direct normal irradiance (W/m²)
    pub dni: Option<f64>,
    /// Diffuse horizontal irradiance (W/m²)
    pub dhi: Option<f64>,
}

/// Optional on-site sensor readings; when present they take precedence over
/// the forecast weather values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub rain: Option<f64>,
    pub lux: Option<f64>,
}

/// Sun data for one hour (or one day, for sunrise/sunset)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstronomySnapshot {
    pub sun_elevation_deg: Option<f64>,
    pub sun_azimuth_deg: Option<f64>,
    pub clear_sky_radiation_wm2: Option<f64>,
    pub sunrise_local: Option<NaiveTime>,
    pub sunset_local: Option<NaiveTime>,
}

impl AstronomySnapshot {
    pub fn sun_position(&self) -> Option<SunPosition> {
        match (finite(self.sun_elevation_deg), finite(self.sun_azimuth_deg)) {
            (Some(elevation), Some(azimuth)) => Some(SunPosition::new(elevation, azimuth)),
            _ => None,
        }
    }

    /// Daylight interval in fractional local hours, if both ends are known
    pub fn daylight_hours(&self) -> Option<(f64, f64)> {
        let sunrise = self.sunrise_local?;
        let sunset = self.sunset_local?;
        let to_hours = |t: NaiveTime| t.hour() as f64 + t.minute() as f64 / 60.0;
        Some((to_hours(sunrise), to_hours(sunset)))
    }
}

/// Weather with defaults applied. Irradiance stays optional: an hour without
/// irradiance data has no physics estimate rather than a zero one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedWeather {
    pub temperature: f64,
    pub humidity: f64,
    pub cloud_cover_percent: f64,
    pub wind_speed: f64,
    pub precipitation: f64,
    pub ghi: Option<f64>,
    pub dni: Option<f64>,
    pub dhi: Option<f64>,
}

impl Default for NormalizedWeather {
    fn default() -> Self {
        Self::from_snapshots(&WeatherSnapshot::default(), None)
    }
}

impl NormalizedWeather {
    pub fn from_snapshots(weather: &WeatherSnapshot, sensor: Option<&SensorSnapshot>) -> Self {
        let sensor = sensor.cloned().unwrap_or_default();
        Self {
            temperature: finite(sensor.temperature)
                .or(finite(weather.temperature))
                .unwrap_or(DEFAULT_TEMPERATURE_C),
            humidity: finite(sensor.humidity)
                .or(finite(weather.humidity))
                .unwrap_or(DEFAULT_HUMIDITY_PERCENT)
                .clamp(0.0, 100.0),
            cloud_cover_percent: finite(weather.cloud_cover_percent)
                .unwrap_or(DEFAULT_CLOUD_COVER_PERCENT)
                .clamp(0.0, 100.0),
            wind_speed: finite(sensor.wind_speed)
                .or(finite(weather.wind_speed))
                .unwrap_or(DEFAULT_WIND_SPEED_MS)
                .max(0.0),
            precipitation: finite(sensor.rain)
                .or(finite(weather.precipitation))
                .unwrap_or(0.0)
                .max(0.0),
            ghi: finite(weather.ghi),
            dni: finite(weather.dni),
            dhi: finite(weather.dhi),
        }
    }

    /// Irradiance for the physics path. Full GHI/DNI/DHI is used as given;
    /// GHI alone is decomposed using cloud cover and sun height.
    pub fn irradiance(&self, sun: &SunPosition) -> Option<Irradiance> {
        match (self.ghi, self.dni, self.dhi) {
            (Some(ghi), Some(dni), Some(dhi)) => Some(Irradiance::new(ghi, dni, dhi)),
            (Some(ghi), _, _) => Some(Irradiance::from_ghi_estimate(
                ghi,
                self.cloud_cover_percent,
                sun,
            )),
            _ => None,
        }
    }
}

/// One observed hour of production, used for training and profiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// Start of the hour, in site-local offset
    pub timestamp: DateTime<FixedOffset>,
    /// Energy produced during the hour (kWh)
    pub actual_kwh: f64,
    #[serde(default)]
    pub weather: WeatherSnapshot,
    #[serde(default)]
    pub sensor: SensorSnapshot,
}

impl TrainingRecord {
    pub fn normalized_weather(&self) -> NormalizedWeather {
        NormalizedWeather::from_snapshots(&self.weather, Some(&self.sensor))
    }

    pub fn is_usable(&self) -> bool {
        self.actual_kwh.is_finite() && self.actual_kwh >= 0.0
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let weather = NormalizedWeather::from_snapshots(&WeatherSnapshot::default(), None);
        assert_eq!(weather.temperature, DEFAULT_TEMPERATURE_C);
        assert_eq!(weather.humidity, DEFAULT_HUMIDITY_PERCENT);
        assert_eq!(weather.cloud_cover_percent, DEFAULT_CLOUD_COVER_PERCENT);
        assert_eq!(weather.wind_speed, DEFAULT_WIND_SPEED_MS);
        assert!(weather.ghi.is_none());
    }

    #[test]
    fn test_sensor_overrides_forecast_values() {
        let weather = WeatherSnapshot {
            temperature: Some(10.0),
            humidity: Some(40.0),
            ..Default::default()
        };
        let sensor = SensorSnapshot {
            temperature: Some(12.5),
            ..Default::default()
        };
        let normalized = NormalizedWeather::from_snapshots(&weather, Some(&sensor));
        assert_eq!(normalized.temperature, 12.5);
        assert_eq!(normalized.humidity, 40.0);
    }

    #[test]
    fn test_non_finite_values_are_treated_as_missing() {
        let weather = WeatherSnapshot {
            cloud_cover_percent: Some(f64::NAN),
            ghi: Some(f64::INFINITY),
            ..Default::default()
        };
        let normalized = NormalizedWeather::from_snapshots(&weather, None);
        assert_eq!(normalized.cloud_cover_percent, DEFAULT_CLOUD_COVER_PERCENT);
        assert!(normalized.ghi.is_none());
    }

    #[test]
    fn test_daylight_hours() {
        let astro = AstronomySnapshot {
            sunrise_local: NaiveTime::from_hms_opt(6, 30, 0),
            sunset_local: NaiveTime::from_hms_opt(19, 15, 0),
            ..Default::default()
        };
        assert_eq!(astro.daylight_hours(), Some((6.5, 19.25)));
    }
}
