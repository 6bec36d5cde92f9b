//! In-memory production history for lag features and the safeguard

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, Timelike};

use crate::domain::TrainingRecord;
use crate::ml::ProductionHistory;

/// Hourly actual production keyed by local date. Rebuilt from the record
/// source on startup and after each training run.
#[derive(Debug, Clone, Default)]
pub struct HistoricalCache {
    days: BTreeMap<NaiveDate, BTreeMap<u32, f64>>,
}

impl HistoricalCache {
    pub fn from_records(records: &[TrainingRecord]) -> Self {
        let mut cache = Self::default();
        for record in records.iter().filter(|r| r.is_usable()) {
            let local = record.timestamp.naive_local();
            cache.record(local.date(), local.hour(), record.actual_kwh);
        }
        cache
    }

    /// Store one hour; a later value for the same hour replaces the earlier one
    pub fn record(&mut self, date: NaiveDate, hour: u32, kwh: f64) {
        if hour < 24 && kwh.is_finite() && kwh >= 0.0 {
            self.days.entry(date).or_default().insert(hour, kwh);
        }
    }

    pub fn len_days(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.days.keys().next_back().copied()
    }

    /// Daily totals of the `lookback_days` days before `today`, oldest first
    pub fn recent_daily_totals(&self, today: NaiveDate, lookback_days: i64) -> Vec<f64> {
        let Some(start) = Duration::try_days(lookback_days.max(0)).and_then(|d| today.checked_sub_signed(d)) else {
            return Vec::new();
        };
        self.days
            .range(start..today)
            .map(|(_, hours)| hours.values().sum())
            .collect()
    }
}

impl ProductionHistory for HistoricalCache {
    fn daily_total(&self, date: NaiveDate) -> Option<f64> {
        self.days.get(&date).map(|hours| hours.values().sum())
    }

    fn hourly(&self, date: NaiveDate, hour: u32) -> Option<f64> {
        self.days.get(&date)?.get(&hour).copied()
    }
}
