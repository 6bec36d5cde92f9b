//! In-memory adapters, used by tests and for ephemeral runs

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::schema::{decode_weights, encode_weights};
use super::{recent_records, StateStore, StoreError, TrainingRecordSource};
use crate::calibration::CalibrationTable;
use crate::domain::TrainingRecord;
use crate::ml::{HourlyProfile, LearnedWeights, ModelStatus};

#[derive(Debug, Default)]
struct Slots {
    weights: Option<Value>,
    weight_backups: Vec<Value>,
    profile: Option<HourlyProfile>,
    calibration: Option<CalibrationTable>,
    status: Option<ModelStatus>,
}

/// State store backed by process memory. Weights go through the same
/// versioned encoding as the file store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    slots: Mutex<Slots>,
    unavailable: bool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails as unreachable
    pub fn unavailable() -> Self {
        Self {
            slots: Mutex::default(),
            unavailable: true,
        }
    }

    /// Seed the raw weights document, e.g. an older schema version
    pub fn with_raw_weights(self, document: Value) -> Self {
        self.slots.lock().weights = Some(document);
        self
    }

    pub fn with_calibration(self, table: CalibrationTable) -> Self {
        self.slots.lock().calibration = Some(table);
        self
    }

    pub fn raw_weights(&self) -> Option<Value> {
        self.slots.lock().weights.clone()
    }

    /// Previous weights documents, oldest first
    pub fn weight_backups(&self) -> Vec<Value> {
        self.slots.lock().weight_backups.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_weights(&self) -> Result<Option<LearnedWeights>, StoreError> {
        self.check()?;
        let document = self.slots.lock().weights.clone();
        document.map(decode_weights).transpose()
    }

    async fn save_weights(&self, weights: &LearnedWeights) -> Result<(), StoreError> {
        self.check()?;
        let document = encode_weights(weights)?;
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.weights.replace(document) {
            slots.weight_backups.push(previous);
        }
        Ok(())
    }

    async fn load_profile(&self) -> Result<Option<HourlyProfile>, StoreError> {
        self.check()?;
        Ok(self.slots.lock().profile.clone())
    }

    async fn save_profile(&self, profile: &HourlyProfile) -> Result<(), StoreError> {
        self.check()?;
        self.slots.lock().profile = Some(profile.clone());
        Ok(())
    }

    async fn load_calibration(&self) -> Result<Option<CalibrationTable>, StoreError> {
        self.check()?;
        Ok(self.slots.lock().calibration.clone())
    }

    async fn save_calibration(&self, table: &CalibrationTable) -> Result<(), StoreError> {
        self.check()?;
        self.slots.lock().calibration = Some(table.clone());
        Ok(())
    }

    async fn load_status(&self) -> Result<Option<ModelStatus>, StoreError> {
        self.check()?;
        Ok(self.slots.lock().status.clone())
    }

    async fn save_status(&self, status: &ModelStatus) -> Result<(), StoreError> {
        self.check()?;
        self.slots.lock().status = Some(status.clone());
        Ok(())
    }
}

/// Record source over a fixed vector
#[derive(Debug, Default, Clone)]
pub struct VecRecordSource {
    records: Vec<TrainingRecord>,
}

impl VecRecordSource {
    pub fn new(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl TrainingRecordSource for VecRecordSource {
    async fn records(&self, days: u32) -> anyhow::Result<Vec<TrainingRecord>> {
        Ok(recent_records(self.records.clone(), days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trained() -> LearnedWeights {
        LearnedWeights {
            weights: [("hour_of_day".to_string(), 0.2)].into_iter().collect(),
            feature_names: vec!["hour_of_day".to_string()],
            last_trained: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_keeps_backup_of_previous_weights() {
        let store = InMemoryStateStore::new();
        assert!(store.load_weights().await.unwrap().is_none());

        store.save_weights(&LearnedWeights::default()).await.unwrap();
        assert!(store.weight_backups().is_empty());

        let weights = trained();
        store.save_weights(&weights).await.unwrap();
        assert_eq!(store.weight_backups().len(), 1);
        assert_eq!(store.load_weights().await.unwrap(), Some(weights));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStateStore::unavailable();
        assert!(matches!(store.load_status().await, Err(StoreError::Unavailable(_))));
        assert!(store.save_profile(&HourlyProfile::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_weights_surface_as_recoverable() {
        let store = InMemoryStateStore::new().with_raw_weights(serde_json::json!("nonsense"));
        let err = store.load_weights().await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
