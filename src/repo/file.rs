//! JSON files in a data directory

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};

use super::schema::{decode_weights, encode_weights};
use super::{recent_records, StateStore, StoreError, TrainingRecordSource};
use crate::calibration::CalibrationTable;
use crate::domain::TrainingRecord;
use crate::ml::{HourlyProfile, LearnedWeights, ModelStatus};

const WEIGHTS_FILE: &str = "learned_weights.json";
const PROFILE_FILE: &str = "hourly_profile.json";
const CALIBRATION_FILE: &str = "calibration.json";
const STATUS_FILE: &str = "model_status.json";

/// One JSON document per piece of state. Writes go to a temp file that is
/// renamed over the target, so readers never see a partial document.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read<T: DeserializeOwned>(&self, file: &str, what: &'static str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(file);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                what,
                reason: e.to_string(),
            })
    }

    async fn write<T: Serialize + Sync>(&self, file: &str, what: &'static str, value: &T) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
            what,
            reason: e.to_string(),
        })?;

        let target = self.dir.join(file);
        let tmp = self.dir.join(format!(".{file}.tmp"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &target).await?;
        debug!(path = %target.display(), "state written");
        Ok(())
    }

    /// Copy the current weights aside before they are replaced
    async fn backup_weights(&self) -> Result<Option<PathBuf>, StoreError> {
        let current = self.dir.join(WEIGHTS_FILE);
        if !fs::try_exists(&current).await? {
            return Ok(None);
        }
        let backup = self.dir.join(format!(
            "learned_weights.{}.bak",
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        fs::copy(&current, &backup).await?;
        info!(path = %backup.display(), "previous weights backed up");
        Ok(Some(backup))
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load_weights(&self) -> Result<Option<LearnedWeights>, StoreError> {
        let document: Option<serde_json::Value> = self.read(WEIGHTS_FILE, "learned weights").await?;
        document.map(decode_weights).transpose()
    }

    async fn save_weights(&self, weights: &LearnedWeights) -> Result<(), StoreError> {
        self.backup_weights().await?;
        self.write(WEIGHTS_FILE, "learned weights", &encode_weights(weights)?).await
    }

    async fn load_profile(&self) -> Result<Option<HourlyProfile>, StoreError> {
        self.read(PROFILE_FILE, "hourly profile").await
    }

    async fn save_profile(&self, profile: &HourlyProfile) -> Result<(), StoreError> {
        self.write(PROFILE_FILE, "hourly profile", profile).await
    }

    async fn load_calibration(&self) -> Result<Option<CalibrationTable>, StoreError> {
        self.read(CALIBRATION_FILE, "calibration").await
    }

    async fn save_calibration(&self, table: &CalibrationTable) -> Result<(), StoreError> {
        self.write(CALIBRATION_FILE, "calibration", table).await
    }

    async fn load_status(&self) -> Result<Option<ModelStatus>, StoreError> {
        self.read(STATUS_FILE, "model status").await
    }

    async fn save_status(&self, status: &ModelStatus) -> Result<(), StoreError> {
        self.write(STATUS_FILE, "model status", status).await
    }
}

/// Training records from a JSON array file
#[derive(Debug, Clone)]
pub struct JsonRecordSource {
    path: PathBuf,
}

impl JsonRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TrainingRecordSource for JsonRecordSource {
    async fn records(&self, days: u32) -> anyhow::Result<Vec<TrainingRecord>> {
        use anyhow::Context;

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let records: Vec<TrainingRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(recent_records(records, days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_missing_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state"));
        assert!(store.load_weights().await.unwrap().is_none());
        assert!(store.load_calibration().await.unwrap().is_none());
        assert!(store.load_status().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_weights_round_trip_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path());

        store.save_weights(&LearnedWeights::default()).await.unwrap();
        let weights = LearnedWeights {
            weights: [("cloudiness".to_string(), -0.3)].into_iter().collect(),
            feature_names: vec!["cloudiness".to_string()],
            last_trained: Some(Utc::now()),
            ..Default::default()
        };
        store.save_weights(&weights).await.unwrap();

        assert_eq!(store.load_weights().await.unwrap(), Some(weights));
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_recoverable_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROFILE_FILE), b"{not json").unwrap();
        let store = JsonFileStateStore::new(dir.path());
        let err = store.load_profile().await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_record_source_reads_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(
            &path,
            r#"[{"timestamp":"2024-06-01T12:00:00+02:00","actual_kwh":2.5,"weather":{"cloud_cover_percent":20.0}}]"#,
        )
        .unwrap();

        let records = JsonRecordSource::new(&path).records(30).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].weather.cloud_cover_percent, Some(20.0));

        let missing = JsonRecordSource::new(dir.path().join("none.json")).records(30).await.unwrap();
        assert!(missing.is_empty());
    }
}
