//! Solar production forecast engine
//!
//! Combines a physics model of the PV array with a learned correction and
//! self-calibrating per-group factors into hourly and daily forecasts.

pub mod calibration;
pub mod config;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod ml;
pub mod physics;
pub mod repo;
pub mod telemetry;

pub use error::{EngineError, ErrorKind};
pub use forecast::ForecastOrchestrator;
