#![allow(dead_code)]

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, TimeZone};
use solar_forecast_engine::config::Config;
use solar_forecast_engine::domain::{AstronomySnapshot, DayInput, HourInput, TrainingRecord, WeatherSnapshot};
use solar_forecast_engine::repo::{InMemoryStateStore, VecRecordSource};
use solar_forecast_engine::ForecastOrchestrator;

pub const UTC_OFFSET_MINUTES: i32 = 120;

pub fn june(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
}

/// Smooth summer sun: rises around 05:00, peaks near 60° at 13:00
pub fn summer_elevation(hour: u32) -> f64 {
    60.0 * ((hour as f64 - 5.0) * std::f64::consts::PI / 16.0).sin()
}

pub fn clear_hour(hour: u32) -> HourInput {
    let elevation = summer_elevation(hour);
    HourInput {
        hour,
        weather: WeatherSnapshot {
            temperature: Some(22.0),
            cloud_cover_percent: Some(15.0),
            ghi: Some((elevation.max(0.0) * 14.0).min(900.0)),
            ..Default::default()
        },
        sensor: None,
        astronomy: Some(AstronomySnapshot {
            sun_elevation_deg: Some(elevation),
            sun_azimuth_deg: Some(90.0 + hour as f64 * 7.5),
            ..Default::default()
        }),
    }
}

pub fn clear_day(date: NaiveDate) -> DayInput {
    DayInput {
        date,
        hours: (0..24).map(clear_hour).collect(),
    }
}

/// Cloud cover that wanders over 5..95 % without a pattern the hour explains
pub fn synthetic_cloud(day: u32, hour: u32) -> f64 {
    ((day * 37 + hour * 11) % 90) as f64 + 5.0
}

/// Hourly records for June 1..=`days`, 06:00-17:00, whose production is an
/// exact linear function of cloud cover
pub fn linear_records(days: u32) -> Vec<TrainingRecord> {
    let tz = FixedOffset::east_opt(UTC_OFFSET_MINUTES * 60).unwrap();
    (1..=days)
        .flat_map(|day| (6..18).map(move |hour| (day, hour)))
        .map(|(day, hour)| {
            let cloud = synthetic_cloud(day, hour);
            TrainingRecord {
                timestamp: tz.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap(),
                actual_kwh: 3.0 - 0.03 * cloud,
                weather: WeatherSnapshot {
                    temperature: Some(24.0 - (hour as f64 - 13.0).abs() * 0.8),
                    humidity: Some(55.0),
                    cloud_cover_percent: Some(cloud),
                    wind_speed: Some(3.0),
                    ..Default::default()
                },
                sensor: Default::default(),
            }
        })
        .collect()
}

/// Flat production of `kwh_per_hour` for 10:00-13:00 on the given days
pub fn small_days(days: &[NaiveDate], kwh_per_hour: f64) -> Vec<TrainingRecord> {
    let tz = FixedOffset::east_opt(UTC_OFFSET_MINUTES * 60).unwrap();
    days.iter()
        .flat_map(|date| (10..14).map(move |hour| (*date, hour)))
        .map(|(date, hour)| TrainingRecord {
            timestamp: tz
                .from_local_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
                .unwrap(),
            actual_kwh: kwh_per_hour,
            weather: WeatherSnapshot {
                cloud_cover_percent: Some(20.0),
                ..Default::default()
            },
            sensor: Default::default(),
        })
        .collect()
}

pub async fn engine_with(
    config: Config,
    store: Arc<InMemoryStateStore>,
    records: Vec<TrainingRecord>,
) -> ForecastOrchestrator {
    match ForecastOrchestrator::initialize(config, store, Arc::new(VecRecordSource::new(records))).await {
        Ok(engine) => engine,
        Err(e) => panic!("initialization failed: {e}"),
    }
}

pub async fn default_engine(records: Vec<TrainingRecord>) -> ForecastOrchestrator {
    engine_with(Config::default(), Arc::new(InMemoryStateStore::new()), records).await
}
