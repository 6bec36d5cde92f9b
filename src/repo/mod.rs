//! Persistence ports and adapters
//!
//! The engine talks to storage only through [`StateStore`] and
//! [`TrainingRecordSource`]. Learned weights are stored as versioned JSON
//! documents; see [`schema`].

use async_trait::async_trait;
use chrono::Duration;

use crate::calibration::CalibrationTable;
use crate::domain::TrainingRecord;
use crate::ml::{HourlyProfile, LearnedWeights, ModelStatus};

pub mod file;
pub mod memory;
pub mod schema;

pub use file::*;
pub use memory::*;
pub use schema::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Stored {what} is corrupt: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("Stored {what} has schema version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        what: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Bad content can be replaced by defaults; a store that cannot be
    /// reached at all cannot.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::UnsupportedVersion { .. })
    }
}

/// Durable engine state. `Ok(None)` means nothing was stored yet.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_weights(&self) -> Result<Option<LearnedWeights>, StoreError>;

    /// Implementations keep a backup of the previous weights before overwriting
    async fn save_weights(&self, weights: &LearnedWeights) -> Result<(), StoreError>;

    async fn load_profile(&self) -> Result<Option<HourlyProfile>, StoreError>;
    async fn save_profile(&self, profile: &HourlyProfile) -> Result<(), StoreError>;

    async fn load_calibration(&self) -> Result<Option<CalibrationTable>, StoreError>;
    async fn save_calibration(&self, table: &CalibrationTable) -> Result<(), StoreError>;

    async fn load_status(&self) -> Result<Option<ModelStatus>, StoreError>;
    async fn save_status(&self, status: &ModelStatus) -> Result<(), StoreError>;
}

/// Observed hourly production with the weather it was produced under
#[async_trait]
pub trait TrainingRecordSource: Send + Sync {
    /// Records of the last `days` days, oldest first
    async fn records(&self, days: u32) -> anyhow::Result<Vec<TrainingRecord>>;
}

/// Sort chronologically and keep the `days` days ending at the newest record
pub fn recent_records(mut records: Vec<TrainingRecord>, days: u32) -> Vec<TrainingRecord> {
    records.sort_by_key(|r| r.timestamp);
    let Some(newest) = records.last().map(|r| r.timestamp) else {
        return records;
    };
    let cutoff = newest - Duration::days(i64::from(days));
    records.retain(|r| r.timestamp > cutoff);
    records
}
