use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const CLEAR_MAX_CLOUD_PERCENT: f64 = 30.0;
pub const OVERCAST_MIN_CLOUD_PERCENT: f64 = 70.0;

/// Weather category for a calibration factor
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WeatherBucket {
    Clear,
    PartlyCloudy,
    Overcast,
    /// Sun close to the horizon, regardless of clouds
    LowSun,
}

impl WeatherBucket {
    pub fn classify(cloud_cover_percent: f64, sun_elevation_deg: f64, low_sun_threshold_deg: f64) -> Self {
        if sun_elevation_deg < low_sun_threshold_deg {
            Self::LowSun
        } else if cloud_cover_percent < CLEAR_MAX_CLOUD_PERCENT {
            Self::Clear
        } else if cloud_cover_percent <= OVERCAST_MIN_CLOUD_PERCENT {
            Self::PartlyCloudy
        } else {
            Self::Overcast
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HourBand {
    Morning,
    Midday,
    Afternoon,
}

impl HourBand {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=10 => Self::Morning,
            11..=14 => Self::Midday,
            _ => Self::Afternoon,
        }
    }
}

/// (weather, hour band) scope of one correction factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub weather: WeatherBucket,
    pub band: HourBand,
}

impl BucketKey {
    pub fn new(weather: WeatherBucket, band: HourBand) -> Self {
        Self { weather, band }
    }

    pub fn classify(
        hour: u32,
        cloud_cover_percent: f64,
        sun_elevation_deg: f64,
        low_sun_threshold_deg: f64,
    ) -> Self {
        Self::new(
            WeatherBucket::classify(cloud_cover_percent, sun_elevation_deg, low_sun_threshold_deg),
            HourBand::from_hour(hour),
        )
    }
}

// Persisted as "weather:band" so the factor table is a plain string-keyed map.
impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.weather, self.band)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid calibration bucket key: {0}")]
pub struct BucketKeyParseError(String);

impl FromStr for BucketKey {
    type Err = BucketKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (weather, band) = s
            .split_once(':')
            .ok_or_else(|| BucketKeyParseError(s.to_string()))?;
        Ok(Self {
            weather: weather.parse().map_err(|_| BucketKeyParseError(s.to_string()))?,
            band: band.parse().map_err(|_| BucketKeyParseError(s.to_string()))?,
        })
    }
}
