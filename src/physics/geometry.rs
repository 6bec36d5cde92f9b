//! # Sun and panel geometry
//!
//! Value types for the sun position and panel orientation, and the angle of
//! incidence between them.
//!
//! Conventions:
//! - Elevation: angle above horizon (0 = horizon, 90 = directly overhead)
//! - Azimuth: clockwise from north (0 = north, 90 = east, 180 = south, 270 = west)
//! - Tilt: 0 = horizontal, 90 = vertical

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Sun position for one hour
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SunPosition {
    pub elevation_deg: f64,
    pub azimuth_deg: f64,
}

impl SunPosition {
    pub fn new(elevation_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            elevation_deg: elevation_deg.clamp(-90.0, 90.0),
            azimuth_deg: azimuth_deg.rem_euclid(360.0),
        }
    }

    pub fn zenith_deg(&self) -> f64 {
        90.0 - self.elevation_deg
    }

    pub fn elevation_rad(&self) -> f64 {
        self.elevation_deg.to_radians()
    }

    pub fn zenith_rad(&self) -> f64 {
        self.zenith_deg().to_radians()
    }

    pub fn azimuth_rad(&self) -> f64 {
        self.azimuth_deg.to_radians()
    }

    pub fn is_above_horizon(&self) -> bool {
        self.elevation_deg > 0.0
    }

    /// Approximate sun position for a UTC instant
    ///
    /// Used only when no astronomy snapshot is available. Declination follows
    /// Cooper's equation; the hour angle ignores the equation of time, which
    /// is accurate to roughly a quarter hour.
    pub fn estimate(time: DateTime<Utc>, latitude_deg: f64, longitude_deg: f64) -> Self {
        let day_of_year = time.ordinal() as f64;
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;

        let declination_rad =
            (23.45 * (360.0 / 365.0 * (day_of_year + 284.0)).to_radians().sin()).to_radians();
        let latitude_rad = latitude_deg.to_radians();

        let solar_time = hour + longitude_deg / 15.0;
        let hour_angle_deg = 15.0 * (solar_time - 12.0);
        let hour_angle_rad = hour_angle_deg.to_radians();

        let elevation_sin = latitude_rad.sin() * declination_rad.sin()
            + latitude_rad.cos() * declination_rad.cos() * hour_angle_rad.cos();
        let elevation_rad = elevation_sin.clamp(-1.0, 1.0).asin();

        let denominator = latitude_rad.cos() * elevation_rad.cos();
        let mut azimuth_deg = if denominator.abs() < 1e-9 {
            180.0
        } else {
            let azimuth_cos =
                (declination_rad.sin() - latitude_rad.sin() * elevation_sin) / denominator;
            azimuth_cos.clamp(-1.0, 1.0).acos().to_degrees()
        };

        // Sun in the western sky after solar noon
        if hour_angle_deg.rem_euclid(360.0) > 0.0 && hour_angle_deg.rem_euclid(360.0) < 180.0 {
            azimuth_deg = 360.0 - azimuth_deg;
        }

        Self::new(elevation_rad.to_degrees(), azimuth_deg)
    }
}

/// Orientation of one panel group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelGeometry {
    pub tilt_deg: f64,
    pub azimuth_deg: f64,
}

impl Default for PanelGeometry {
    fn default() -> Self {
        Self {
            tilt_deg: 30.0,
            azimuth_deg: 180.0,
        }
    }
}

impl PanelGeometry {
    pub fn new(tilt_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            tilt_deg: tilt_deg.clamp(0.0, 90.0),
            azimuth_deg: azimuth_deg.rem_euclid(360.0),
        }
    }

    pub fn tilt_rad(&self) -> f64 {
        self.tilt_deg.to_radians()
    }

    /// Angle of incidence in degrees (0 - 180)
    ///
    /// Spherical law of cosines between the sun vector and the panel normal.
    /// Returns 90 whenever the sun is at or below the horizon.
    pub fn angle_of_incidence(&self, sun: &SunPosition) -> f64 {
        if !sun.is_above_horizon() {
            return 90.0;
        }

        let zenith = sun.zenith_rad();
        let tilt = self.tilt_rad();
        let azimuth_diff = (sun.azimuth_deg - self.azimuth_deg).to_radians();

        let cos_aoi =
            zenith.cos() * tilt.cos() + zenith.sin() * tilt.sin() * azimuth_diff.cos();
        cos_aoi.clamp(-1.0, 1.0).acos().to_degrees()
    }
}
