//! Hours in which production is plausible

use crate::domain::AstronomySnapshot;
use crate::physics::TWILIGHT_START_DEG;

/// What decided the window for an hour
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WindowSource {
    Daylight,
    SunElevation,
    Seasonal,
}

/// Fixed local-hour ranges (inclusive) used without astronomy data
pub fn seasonal_range(month: u32) -> (u32, u32) {
    match month {
        11 | 12 | 1 | 2 => (6, 17),
        5..=8 => (4, 21),
        _ => (5, 19),
    }
}

/// Whether `hour` (local, 0-23) can produce. Sunrise/sunset wins over sun
/// elevation, which wins over the month table.
pub fn is_production_hour(month: u32, hour: u32, astronomy: Option<&AstronomySnapshot>) -> (bool, WindowSource) {
    if let Some((sunrise, sunset)) = astronomy.and_then(AstronomySnapshot::daylight_hours) {
        // The hour [h, h+1) overlaps daylight
        let start = hour as f64;
        return (start + 1.0 > sunrise && start < sunset, WindowSource::Daylight);
    }

    if let Some(elevation) = astronomy
        .and_then(|a| a.sun_elevation_deg)
        .filter(|e| e.is_finite())
    {
        return (elevation > TWILIGHT_START_DEG, WindowSource::SunElevation);
    }

    let (first, last) = seasonal_range(month);
    ((first..=last).contains(&hour), WindowSource::Seasonal)
}
