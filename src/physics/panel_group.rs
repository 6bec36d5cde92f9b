//! # Panel groups
//!
//! A site may have several arrays with different orientations (e.g. an east
//! and a west roof). Each group is simulated on its own, corrected by its own
//! calibration factor, and then summed.

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::geometry::{PanelGeometry, SunPosition};
use super::irradiance::{Irradiance, IrradianceModel, PoaResult};
use super::thermal::ThermalModel;
use crate::calibration::{BucketKey, CalibrationTable};

pub const IMPLICIT_GROUP_NAME: &str = "system";
pub const DEFAULT_SYSTEM_EFFICIENCY: f64 = 0.90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PanelGroup {
    #[validate(length(min = 1))]
    pub name: String,
    /// Nominal peak power (Wp)
    #[validate(range(exclusive_min = 0.0))]
    pub power_wp: f64,
    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth_deg: f64,
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt_deg: f64,
    /// Energy sensor reporting this group's own production, if any
    #[serde(default)]
    pub energy_sensor: Option<String>,
}

impl PanelGroup {
    pub fn new(name: impl Into<String>, power_wp: f64, azimuth_deg: f64, tilt_deg: f64) -> Self {
        Self {
            name: name.into(),
            power_wp,
            azimuth_deg,
            tilt_deg,
            energy_sensor: None,
        }
    }

    pub fn power_kwp(&self) -> f64 {
        self.power_wp / 1000.0
    }

    pub fn geometry(&self) -> PanelGeometry {
        PanelGeometry::new(self.tilt_deg, self.azimuth_deg)
    }
}

/// Conditions shared by all groups for one hour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourConditions {
    pub hour: u32,
    pub irradiance: Irradiance,
    pub sun: SunPosition,
    pub ambient_temp_c: f64,
    pub cloud_cover_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOutput {
    pub name: String,
    /// Calibrated energy for the hour (kWh)
    pub power_kwh: f64,
    /// Physics-only energy before calibration (kWh)
    pub raw_power_kwh: f64,
    pub calibration_factor: f64,
    pub poa: PoaResult,
    pub cell_temperature_c: f64,
    pub contribution_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiGroupOutput {
    pub total_power_kwh: f64,
    pub raw_total_power_kwh: f64,
    pub total_capacity_kwp: f64,
    pub groups: Vec<GroupOutput>,
}

#[derive(Debug, Clone)]
pub struct PanelGroupEngine {
    groups: Vec<PanelGroup>,
    irradiance_model: IrradianceModel,
    thermal: ThermalModel,
    system_efficiency: f64,
    low_sun_elevation_deg: f64,
    implicit: bool,
}

impl PanelGroupEngine {
    /// Build the engine; with no groups configured the whole `capacity_kwp`
    /// becomes one south-facing group tilted 30°.
    pub fn new(
        groups: Vec<PanelGroup>,
        capacity_kwp: f64,
        albedo: f64,
        system_efficiency: f64,
        low_sun_elevation_deg: f64,
    ) -> Self {
        let implicit = groups.is_empty();
        let groups = if implicit {
            let geometry = PanelGeometry::default();
            vec![PanelGroup::new(
                IMPLICIT_GROUP_NAME,
                capacity_kwp.max(0.0) * 1000.0,
                geometry.azimuth_deg,
                geometry.tilt_deg,
            )]
        } else {
            groups
        };

        Self {
            groups,
            irradiance_model: IrradianceModel::new(albedo),
            thermal: ThermalModel::default(),
            system_efficiency: system_efficiency.clamp(0.0, 1.0),
            low_sun_elevation_deg,
            implicit,
        }
    }

    pub fn groups(&self) -> &[PanelGroup] {
        &self.groups
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn total_capacity_kwp(&self) -> f64 {
        self.groups.iter().map(PanelGroup::power_kwp).sum()
    }

    pub fn bucket_for(&self, conditions: &HourConditions) -> BucketKey {
        BucketKey::classify(
            conditions.hour,
            conditions.cloud_cover_percent,
            conditions.sun.elevation_deg,
            self.low_sun_elevation_deg,
        )
    }

    /// Uncalibrated physics output of one group for one hour (kWh)
    pub fn raw_group_output(&self, group: &PanelGroup, conditions: &HourConditions) -> (PoaResult, f64, f64) {
        let poa = self.irradiance_model.plane_of_array(
            &conditions.irradiance,
            &conditions.sun,
            &group.geometry(),
        );
        let thermal = self.thermal.derate(conditions.ambient_temp_c, poa.total_wm2);
        let power_kwh =
            poa.total_wm2 / 1000.0 * group.power_kwp() * thermal.correction * self.system_efficiency;
        (poa, thermal.cell_temperature_c, power_kwh.max(0.0))
    }

    pub fn calculate_group(
        &self,
        group: &PanelGroup,
        conditions: &HourConditions,
        calibration: &CalibrationTable,
    ) -> GroupOutput {
        let (poa, cell_temperature_c, raw_power_kwh) = self.raw_group_output(group, conditions);
        let calibration_factor = calibration.factor(&group.name, &self.bucket_for(conditions));

        GroupOutput {
            name: group.name.clone(),
            power_kwh: raw_power_kwh * calibration_factor,
            raw_power_kwh,
            calibration_factor,
            poa,
            cell_temperature_c,
            contribution_percent: 0.0,
        }
    }

    pub fn calculate_total(
        &self,
        conditions: &HourConditions,
        calibration: &CalibrationTable,
    ) -> MultiGroupOutput {
        let mut groups: Vec<GroupOutput> = self
            .groups
            .iter()
            .map(|group| self.calculate_group(group, conditions, calibration))
            .collect();

        let total_power_kwh: f64 = groups.iter().map(|g| g.power_kwh).sum();
        let raw_total_power_kwh: f64 = groups.iter().map(|g| g.raw_power_kwh).sum();

        if total_power_kwh > 0.0 {
            for group in &mut groups {
                group.contribution_percent = group.power_kwh / total_power_kwh * 100.0;
            }
        }

        MultiGroupOutput {
            total_power_kwh,
            raw_total_power_kwh,
            total_capacity_kwp: self.total_capacity_kwp(),
            groups,
        }
    }

    /// Hour with the highest calibrated output for one group over a day
    pub fn optimal_hour(
        &self,
        group_name: &str,
        day: &[HourConditions],
        calibration: &CalibrationTable,
    ) -> Option<(u32, f64)> {
        let group = self.groups.iter().find(|g| g.name == group_name)?;
        day.iter()
            .map(|conditions| {
                let output = self.calculate_group(group, conditions, calibration);
                (conditions.hour, output.power_kwh)
            })
            .filter(|(_, kwh)| *kwh > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}
