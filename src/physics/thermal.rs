//! Cell temperature and power derating (NOCT model)

use serde::{Deserialize, Serialize};

/// Crystalline silicon power temperature coefficient (1/°C)
pub const TEMP_COEFFICIENT: f64 = -0.004;
pub const STC_TEMPERATURE_C: f64 = 25.0;
pub const NOCT_C: f64 = 45.0;
pub const NOCT_AMBIENT_C: f64 = 20.0;
pub const NOCT_IRRADIANCE_WM2: f64 = 800.0;

pub const MIN_TEMPERATURE_CORRECTION: f64 = 0.5;
pub const MAX_TEMPERATURE_CORRECTION: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalResult {
    pub cell_temperature_c: f64,
    pub correction: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ThermalModel {
    temp_coefficient: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self {
            temp_coefficient: TEMP_COEFFICIENT,
        }
    }
}

impl ThermalModel {
    pub fn cell_temperature(&self, ambient_c: f64, poa_wm2: f64) -> f64 {
        if poa_wm2 <= 0.0 {
            return ambient_c;
        }
        ambient_c + (NOCT_C - NOCT_AMBIENT_C) * (poa_wm2 / NOCT_IRRADIANCE_WM2)
    }

    pub fn temperature_correction(&self, cell_temperature_c: f64) -> f64 {
        (1.0 + self.temp_coefficient * (cell_temperature_c - STC_TEMPERATURE_C))
            .clamp(MIN_TEMPERATURE_CORRECTION, MAX_TEMPERATURE_CORRECTION)
    }

    pub fn derate(&self, ambient_c: f64, poa_wm2: f64) -> ThermalResult {
        let cell_temperature_c = self.cell_temperature(ambient_c, poa_wm2);
        ThermalResult {
            cell_temperature_c,
            correction: self.temperature_correction(cell_temperature_c),
        }
    }
}
