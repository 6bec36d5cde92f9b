//! # Plane-of-array irradiance
//!
//! Isotropic-sky transposition of GHI/DNI/DHI onto a tilted surface:
//!
//! ```text
//! POA = DNI·cos(AOI) + DHI·(1 + cos β)/2·t + GHI·ρ·(1 − cos β)/2·t
//! ```
//!
//! where β is the panel tilt, ρ the ground albedo and t the twilight factor
//! that ramps the sky and ground terms in around sunrise and sunset.

use serde::{Deserialize, Serialize};

use super::geometry::{PanelGeometry, SunPosition};

/// Upper physical bound for any irradiance component (W/m²)
pub const MAX_IRRADIANCE_WM2: f64 = 1400.0;
pub const DEFAULT_ALBEDO: f64 = 0.2;

/// Elevation where diffuse capture starts
pub const TWILIGHT_START_DEG: f64 = -2.0;
/// Elevation where diffuse capture reaches full strength
pub const TWILIGHT_FULL_DEG: f64 = 3.0;

const MAX_ESTIMATED_DNI_WM2: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Irradiance {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

impl Irradiance {
    pub fn new(ghi: f64, dni: f64, dhi: f64) -> Self {
        Self { ghi, dni, dhi }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// All components finite, non-negative and within the physical bound
    pub fn is_valid(&self) -> bool {
        [self.ghi, self.dni, self.dhi]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0 && *v <= MAX_IRRADIANCE_WM2)
    }

    /// Split a bare GHI reading into beam and diffuse parts
    ///
    /// The diffuse fraction grows linearly with cloud cover from 0.2 (clear)
    /// to 0.95 (overcast); with the sun down everything is diffuse.
    pub fn from_ghi_estimate(ghi: f64, cloud_cover_percent: f64, sun: &SunPosition) -> Self {
        let ghi = ghi.max(0.0);
        if !sun.is_above_horizon() {
            return Self::new(ghi, 0.0, ghi);
        }

        let diffuse_fraction = (0.2 + 0.75 * cloud_cover_percent.clamp(0.0, 100.0) / 100.0).min(1.0);
        let dhi = ghi * diffuse_fraction;
        let sin_elevation = sun.elevation_rad().sin().max(0.05);
        let dni = ((ghi - dhi) / sin_elevation).clamp(0.0, MAX_ESTIMATED_DNI_WM2);

        Self::new(ghi, dni, dhi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoaResult {
    pub total_wm2: f64,
    pub beam_wm2: f64,
    pub diffuse_wm2: f64,
    pub ground_wm2: f64,
    /// Angle of incidence, capped at 90 when the sun is behind the panel
    pub aoi_deg: f64,
}

impl PoaResult {
    pub fn zero() -> Self {
        Self {
            total_wm2: 0.0,
            beam_wm2: 0.0,
            diffuse_wm2: 0.0,
            ground_wm2: 0.0,
            aoi_deg: 90.0,
        }
    }
}

/// Damping applied to the diffuse and ground terms near the horizon
pub fn twilight_factor(elevation_deg: f64) -> f64 {
    if elevation_deg >= TWILIGHT_FULL_DEG {
        1.0
    } else {
        ((elevation_deg - TWILIGHT_START_DEG) / (TWILIGHT_FULL_DEG - TWILIGHT_START_DEG)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IrradianceModel {
    albedo: f64,
}

impl Default for IrradianceModel {
    fn default() -> Self {
        Self::new(DEFAULT_ALBEDO)
    }
}

impl IrradianceModel {
    pub fn new(albedo: f64) -> Self {
        Self {
            albedo: albedo.clamp(0.0, 1.0),
        }
    }

    pub fn albedo(&self) -> f64 {
        self.albedo
    }

    pub fn plane_of_array(
        &self,
        irradiance: &Irradiance,
        sun: &SunPosition,
        geometry: &PanelGeometry,
    ) -> PoaResult {
        if !irradiance.is_valid() {
            return PoaResult::zero();
        }

        let aoi_deg = geometry.angle_of_incidence(sun);
        let tilt = geometry.tilt_rad();

        let beam_wm2 = if sun.is_above_horizon() && aoi_deg < 90.0 {
            irradiance.dni * aoi_deg.to_radians().cos()
        } else {
            0.0
        };

        let twilight = twilight_factor(sun.elevation_deg);
        let diffuse_wm2 = irradiance.dhi * (1.0 + tilt.cos()) / 2.0 * twilight;
        let ground_wm2 = irradiance.ghi * self.albedo * (1.0 - tilt.cos()) / 2.0 * twilight;

        PoaResult {
            total_wm2: (beam_wm2 + diffuse_wm2 + ground_wm2).max(0.0),
            beam_wm2,
            diffuse_wm2,
            ground_wm2,
            aoi_deg: aoi_deg.min(90.0),
        }
    }
}
