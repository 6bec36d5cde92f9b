use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};
use tracing::{debug, info, warn};

use super::bucket::BucketKey;
use crate::config::CalibrationConfig;
use crate::domain::{CalibrationResult, RescuedGroup};

/// One multiplicative correction factor with its smoothing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorEntry {
    pub factor: f64,
    pub samples: u32,
    /// Last day folded into this factor; older or equal days are skipped
    pub last_date: Option<NaiveDate>,
}

impl Default for FactorEntry {
    fn default() -> Self {
        Self {
            factor: 1.0,
            samples: 0,
            last_date: None,
        }
    }
}

impl FactorEntry {
    fn starting_at(factor: f64) -> Self {
        Self {
            factor,
            ..Self::default()
        }
    }

    fn is_new_day(&self, date: NaiveDate) -> bool {
        self.last_date.map_or(true, |last| date > last)
    }

    fn blend(&mut self, ratio: f64, samples: u32, date: NaiveDate, bounds: (f64, f64), cfg: &CalibrationConfig) {
        let (min, max) = bounds;
        let alpha = if self.samples < cfg.stable_after_samples {
            cfg.alpha_initial
        } else {
            cfg.alpha_stable
        };
        let ratio = ratio.clamp(min, max);
        self.factor = (self.factor * (1.0 - alpha) + ratio * alpha).clamp(min, max);
        self.samples = self.samples.saturating_add(samples);
        self.last_date = Some(date);
    }
}

/// Set when a group was lifted out of the normal bound by a rescue run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueMark {
    pub max_factor: f64,
    pub rescued_on: NaiveDate,
    pub factor: f64,
    pub qualifying_days: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupCalibration {
    pub global: FactorEntry,
    /// Keyed by `BucketKey` in its "weather:band" form
    #[serde(default)]
    pub buckets: BTreeMap<String, FactorEntry>,
    #[serde(default)]
    pub rescue: Option<RescueMark>,
}

impl GroupCalibration {
    /// Active [min, max] for this group: the normal bound, widened after a rescue
    pub fn bounds(&self, cfg: &CalibrationConfig) -> (f64, f64) {
        let max = self
            .rescue
            .as_ref()
            .map_or(cfg.normal_max, |mark| mark.max_factor.max(cfg.normal_max));
        (cfg.normal_min, max)
    }

    pub fn factor_for(&self, key: &BucketKey) -> f64 {
        self.buckets
            .get(&key.to_string())
            .map_or(self.global.factor, |entry| entry.factor)
    }
}

/// Actual vs. uncalibrated physics output for one group and hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub group: String,
    pub date: NaiveDate,
    pub hour: u32,
    pub cloud_cover_percent: f64,
    pub sun_elevation_deg: f64,
    pub predicted_kwh: f64,
    pub actual_kwh: f64,
}

impl CalibrationObservation {
    fn is_usable(&self, cfg: &CalibrationConfig) -> bool {
        self.predicted_kwh.is_finite()
            && self.actual_kwh.is_finite()
            && self.actual_kwh >= 0.0
            && self.predicted_kwh >= cfg.min_predicted_kwh
    }

    pub fn bucket(&self, cfg: &CalibrationConfig) -> BucketKey {
        BucketKey::classify(
            self.hour,
            self.cloud_cover_percent,
            self.sun_elevation_deg,
            cfg.low_sun_elevation_deg,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sums {
    actual: f64,
    predicted: f64,
    count: u32,
}

impl Sums {
    fn add(&mut self, obs: &CalibrationObservation) {
        self.actual += obs.actual_kwh;
        self.predicted += obs.predicted_kwh;
        self.count += 1;
    }

    fn ratio(&self) -> Option<f64> {
        (self.predicted > 0.0).then(|| self.actual / self.predicted)
    }
}

/// Correction factors for every panel group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    #[serde(default)]
    groups: BTreeMap<String, GroupCalibration>,
}

impl CalibrationTable {
    /// Factor for a group and bucket: bucket entry, then the group's global
    /// factor, then 1.0 for unknown groups.
    pub fn factor(&self, group: &str, key: &BucketKey) -> f64 {
        self.groups.get(group).map_or(1.0, |g| g.factor_for(key))
    }

    pub fn group(&self, name: &str) -> Option<&GroupCalibration> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&String, &GroupCalibration)> {
        self.groups.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Normal-mode update: exponential smoothing of each (group, bucket)
    /// factor towards the observed actual/physics ratio.
    ///
    /// Days already folded into an entry are skipped, so repeating the same
    /// update leaves the table unchanged.
    pub fn apply_observations(
        &mut self,
        observations: &[CalibrationObservation],
        cfg: &CalibrationConfig,
    ) -> CalibrationResult {
        let by_group: BTreeMap<&str, Vec<&CalibrationObservation>> = observations
            .iter()
            .filter(|obs| obs.is_usable(cfg))
            .map(|obs| (obs.group.as_str(), obs))
            .into_group_map()
            .into_iter()
            .collect();

        if by_group.is_empty() {
            return CalibrationResult::nothing_to_do("no usable observations");
        }

        let mut groups_calibrated = 0;
        let mut total_samples = 0usize;
        let mut factors = Vec::new();

        for (name, group_obs) in by_group {
            let group = self.groups.entry(name.to_string()).or_default();
            let bounds = group.bounds(cfg);
            let mut applied = 0u32;

            let mut daily: BTreeMap<NaiveDate, Sums> = BTreeMap::new();
            let mut bucketed: BTreeMap<(NaiveDate, BucketKey), Sums> = BTreeMap::new();
            for obs in &group_obs {
                daily.entry(obs.date).or_default().add(obs);
                bucketed.entry((obs.date, obs.bucket(cfg))).or_default().add(obs);
            }

            for (date, sums) in &daily {
                if let (true, Some(ratio)) = (group.global.is_new_day(*date), sums.ratio()) {
                    group.global.blend(ratio, sums.count, *date, bounds, cfg);
                    applied += sums.count;
                }
            }

            for ((date, key), sums) in &bucketed {
                let start = group.global.factor;
                let entry = group
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| FactorEntry::starting_at(start));
                if let (true, Some(ratio)) = (entry.is_new_day(*date), sums.ratio()) {
                    entry.blend(ratio, sums.count, *date, bounds, cfg);
                }
            }

            // A rescued group that has drifted back into the normal range no
            // longer needs the widened bound.
            if group.rescue.is_some() && group.global.factor <= cfg.normal_max {
                info!(group = name, factor = group.global.factor, "rescue bound released");
                group.rescue = None;
                for entry in group.buckets.values_mut() {
                    entry.factor = entry.factor.clamp(cfg.normal_min, cfg.normal_max);
                }
            }

            if applied > 0 {
                groups_calibrated += 1;
                total_samples += applied as usize;
                factors.push(group.global.factor);
                debug!(group = name, factor = group.global.factor, samples = applied, "calibration updated");
            }
        }

        let avg_correction_factor = mean_or_one(&factors);
        CalibrationResult {
            success: groups_calibrated > 0,
            groups_calibrated,
            total_samples,
            avg_correction_factor,
            message: if groups_calibrated > 0 {
                format!("calibrated {groups_calibrated} group(s) from {total_samples} samples")
            } else {
                "no new days to apply".to_string()
            },
            rescued: Vec::new(),
        }
    }

    /// One-shot recomputation for groups whose daily actual/physics ratio
    /// exceeded `rescue_ratio_threshold` on at least `rescue_min_days` days
    /// within the lookback window.
    ///
    /// `capacity_kwp` maps a group name to its configured capacity and is
    /// only used to report the capacity the rescue factor implies.
    pub fn rescue<F>(
        &mut self,
        observations: &[CalibrationObservation],
        today: NaiveDate,
        capacity_kwp: F,
        cfg: &CalibrationConfig,
    ) -> CalibrationResult
    where
        F: Fn(&str) -> f64,
    {
        let window_start = today - Duration::days(cfg.rescue_lookback_days);
        let mut daily: BTreeMap<&str, BTreeMap<NaiveDate, Sums>> = BTreeMap::new();
        for obs in observations
            .iter()
            .filter(|obs| obs.is_usable(cfg) && obs.date > window_start && obs.date <= today)
        {
            daily
                .entry(obs.group.as_str())
                .or_default()
                .entry(obs.date)
                .or_default()
                .add(obs);
        }

        let mut rescued = Vec::new();
        for (name, days) in daily {
            let qualifying: Vec<f64> = days
                .values()
                .filter_map(Sums::ratio)
                .filter(|ratio| *ratio > cfg.rescue_ratio_threshold)
                .collect();

            if qualifying.len() < cfg.rescue_min_days {
                debug!(group = name, qualifying_days = qualifying.len(), "group does not need rescue");
                continue;
            }

            let factor = Data::new(qualifying.clone())
                .median()
                .clamp(cfg.normal_min, cfg.rescue_max);
            let samples: u32 = days.values().map(|s| s.count).sum();
            let last_date = days.keys().next_back().copied();

            let group = self.groups.entry(name.to_string()).or_default();
            group.global = FactorEntry {
                factor,
                samples,
                last_date,
            };
            for entry in group.buckets.values_mut() {
                entry.factor = factor;
                entry.last_date = last_date.max(entry.last_date);
            }
            group.rescue = Some(RescueMark {
                max_factor: cfg.rescue_max,
                rescued_on: today,
                factor,
                qualifying_days: qualifying.len(),
            });

            let implied_capacity_kwp = capacity_kwp(name) * factor;
            warn!(
                group = name,
                factor,
                qualifying_days = qualifying.len(),
                samples,
                implied_capacity_kwp,
                "rescue calibration applied; check the configured capacity"
            );

            rescued.push(RescuedGroup {
                group: name.to_string(),
                samples: samples as usize,
                days: qualifying.len(),
                factor,
                implied_capacity_kwp,
            });
        }

        if rescued.is_empty() {
            return CalibrationResult::nothing_to_do(format!(
                "no group exceeded ratio {} on {} or more days",
                cfg.rescue_ratio_threshold, cfg.rescue_min_days
            ));
        }

        let factors: Vec<f64> = rescued.iter().map(|g| g.factor).collect();
        CalibrationResult {
            success: true,
            groups_calibrated: rescued.len(),
            total_samples: rescued.iter().map(|g| g.samples).sum(),
            avg_correction_factor: mean_or_one(&factors),
            message: format!(
                "rescued {}",
                rescued.iter().map(|g| format!("{} ({:.2}x)", g.group, g.factor)).join(", ")
            ),
            rescued,
        }
    }
}

fn mean_or_one(values: &[f64]) -> f64 {
    if values.is_empty() {
        1.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{HourBand, WeatherBucket};
    use proptest::prelude::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn obs(group: &str, day: u32, hour: u32, predicted: f64, actual: f64) -> CalibrationObservation {
        CalibrationObservation {
            group: group.to_string(),
            date: date(day),
            hour,
            cloud_cover_percent: 10.0,
            sun_elevation_deg: 45.0,
            predicted_kwh: predicted,
            actual_kwh: actual,
        }
    }

    fn obs_in(group: &str, day: u32, hour: u32, predicted: f64, actual: f64) -> CalibrationObservation {
        CalibrationObservation {
            cloud_cover_percent: 50.0,
            ..obs(group, day, hour, predicted, actual)
        }
    }

    #[test]
    fn test_unknown_group_has_unit_factor() {
        let table = CalibrationTable::default();
        let key = BucketKey::new(WeatherBucket::Clear, HourBand::Midday);
        assert_eq!(table.factor("south", &key), 1.0);
    }

    #[test]
    fn test_update_moves_towards_ratio() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let result = table.apply_observations(&[obs("south", 1, 12, 2.0, 2.4)], &cfg);

        assert!(result.success);
        assert_eq!(result.groups_calibrated, 1);
        let factor = table.group("south").unwrap().global.factor;
        // 1.0 * 0.7 + 1.2 * 0.3
        assert!((factor - 1.06).abs() < 1e-9, "got {}", factor);

        let key = BucketKey::new(WeatherBucket::Clear, HourBand::Midday);
        assert!(table.factor("south", &key) > 1.0);
    }

    #[test]
    fn test_repeated_day_is_not_applied_twice() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let day = vec![obs("south", 1, 12, 2.0, 3.0), obs("south", 1, 13, 2.0, 3.0)];

        table.apply_observations(&day, &cfg);
        let once = table.clone();
        let second = table.apply_observations(&day, &cfg);

        assert_eq!(table, once);
        assert_eq!(second.groups_calibrated, 0);
    }

    #[test]
    fn test_ratio_clamped_to_normal_bound() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        for day in 1..=30 {
            table.apply_observations(&[obs("south", day, 12, 1.0, 25.0)], &cfg);
        }
        let factor = table.group("south").unwrap().global.factor;
        assert!(factor <= cfg.normal_max + 1e-12);
        assert!((factor - cfg.normal_max).abs() < 0.05);
    }

    #[test]
    fn test_tiny_predictions_are_ignored() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let result = table.apply_observations(&[obs("south", 1, 6, 0.001, 0.5)], &cfg);
        assert!(!result.success);
        assert!(table.is_empty());
    }

    #[test]
    fn test_rescue_requires_two_days() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let result = table.rescue(&[obs("south", 1, 12, 0.2, 4.0)], date(2), |_| 5.0, &cfg);
        assert!(!result.success);
        assert!(table.group("south").is_none());
    }

    #[test]
    fn test_rescue_then_normal_updates_stay_in_rescue_bound() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let history = vec![
            obs("south", 1, 12, 0.2, 4.0),
            obs("south", 2, 12, 0.2, 4.4),
            obs("east", 1, 9, 1.0, 1.1),
        ];
        // Normal mode caps at the normal bound first
        table.apply_observations(&history, &cfg);
        assert!(table.group("south").unwrap().global.factor <= cfg.normal_max);

        let result = table.rescue(&history, date(3), |_| 5.0, &cfg);
        assert!(result.success);
        assert_eq!(result.rescued.len(), 1);
        let rescued = &result.rescued[0];
        assert_eq!(rescued.group, "south");
        assert_eq!(rescued.days, 2);
        assert!((rescued.factor - 21.0).abs() < 1e-9);
        assert!((rescued.implied_capacity_kwp - 105.0).abs() < 1e-9);

        let group = table.group("south").unwrap();
        assert!(group.global.factor > cfg.normal_max);
        assert!(group.global.factor <= cfg.rescue_max);
        assert_eq!(group.bounds(&cfg), (cfg.normal_min, cfg.rescue_max));

        for day in 3..=10 {
            table.apply_observations(&[obs("south", day, 12, 0.2, 4.2)], &cfg);
            let factor = table.group("south").unwrap().global.factor;
            assert!(factor > cfg.normal_max, "snapped back to {}", factor);
            assert!(factor <= cfg.rescue_max);
        }
    }

    #[test]
    fn test_rescue_release_pulls_buckets_into_normal_bound() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        for day in 1..=5 {
            table.apply_observations(&[obs("south", day, 12, 1.0, 1.0)], &cfg);
        }
        let spikes = vec![obs("south", 6, 12, 1.0, 20.0), obs("south", 7, 12, 1.0, 20.0)];
        assert!(table.rescue(&spikes, date(7), |_| 5.0, &cfg).success);

        // Daily updates land in a different bucket, so only the global
        // factor drifts back towards 1
        let mut day = 8;
        while table.group("south").unwrap().rescue.is_some() {
            assert!(day <= 30, "rescue bound never released");
            table.apply_observations(&[obs_in("south", day, 7, 1.0, 1.0)], &cfg);
            day += 1;
        }

        let group = table.group("south").unwrap();
        assert_eq!(group.bounds(&cfg), (cfg.normal_min, cfg.normal_max));
        for (key, entry) in &group.buckets {
            assert!(entry.factor <= cfg.normal_max, "{key} kept {}", entry.factor);
            assert!(entry.factor >= cfg.normal_min);
        }
        let midday = BucketKey::new(WeatherBucket::Clear, HourBand::Midday);
        assert!(table.factor("south", &midday) <= cfg.normal_max);
    }

    #[test]
    fn test_rescue_ignores_days_outside_lookback() {
        let cfg = CalibrationConfig::default();
        let mut table = CalibrationTable::default();
        let history = vec![obs("south", 1, 12, 0.2, 4.0), obs("south", 2, 12, 0.2, 4.0)];
        let result = table.rescue(&history, date(30), |_| 5.0, &cfg);
        assert!(!result.success);
    }

    proptest! {
        #[test]
        fn prop_normal_update_stays_in_bound(
            ratios in proptest::collection::vec(0.0..100.0f64, 1..40),
        ) {
            let cfg = CalibrationConfig::default();
            let mut table = CalibrationTable::default();
            for (i, ratio) in ratios.iter().enumerate() {
                let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(i as i64);
                let observation = CalibrationObservation {
                    group: "g".to_string(),
                    date: day,
                    hour: 12,
                    cloud_cover_percent: 50.0,
                    sun_elevation_deg: 30.0,
                    predicted_kwh: 1.0,
                    actual_kwh: *ratio,
                };
                table.apply_observations(&[observation], &cfg);
                let group = table.group("g").unwrap();
                prop_assert!(group.global.factor >= cfg.normal_min - 1e-12);
                prop_assert!(group.global.factor <= cfg.normal_max + 1e-12);
                for entry in group.buckets.values() {
                    prop_assert!(entry.factor >= cfg.normal_min - 1e-12);
                    prop_assert!(entry.factor <= cfg.normal_max + 1e-12);
                }
            }
        }

        #[test]
        fn prop_rescue_factor_within_rescue_bound(
            first in 10.5..500.0f64,
            second in 10.5..500.0f64,
        ) {
            let cfg = CalibrationConfig::default();
            let mut table = CalibrationTable::default();
            let history = vec![
                obs("g", 1, 12, 1.0, first),
                obs("g", 2, 12, 1.0, second),
            ];
            let result = table.rescue(&history, date(3), |_| 1.0, &cfg);
            prop_assert!(result.success);
            let factor = table.group("g").unwrap().global.factor;
            prop_assert!(factor >= cfg.normal_min && factor <= cfg.rescue_max);
        }
    }
}
