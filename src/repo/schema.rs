//! Versioned encoding of learned weights
//!
//! Version history:
//! - 1: weights under `weather_weights`, scaler as flat `feature_means` /
//!   `feature_stds` next to `feature_names`
//! - 2: weights under `weights`, scaler nested as `scaler`
//!
//! Documents without a `schema_version` are version 1.

use serde_json::{Map, Value};

use super::StoreError;
use crate::ml::LearnedWeights;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
const SCHEMA_FIELD: &str = "schema_version";
const WHAT: &str = "learned weights";

type Migration = fn(&mut Map<String, Value>) -> Result<(), StoreError>;

/// Index `n` migrates version `n + 1` to `n + 2`
const MIGRATIONS: [Migration; (CURRENT_SCHEMA_VERSION - 1) as usize] = [migrate_v1_to_v2];

pub fn encode_weights(weights: &LearnedWeights) -> Result<Value, StoreError> {
    let mut value = serde_json::to_value(weights).map_err(|e| corrupt(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert(SCHEMA_FIELD.to_string(), Value::from(CURRENT_SCHEMA_VERSION));
    }
    Ok(value)
}

pub fn decode_weights(value: Value) -> Result<LearnedWeights, StoreError> {
    let Value::Object(mut map) = value else {
        return Err(corrupt("expected a JSON object"));
    };

    let version = match map.remove(SCHEMA_FIELD) {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| corrupt(format!("invalid {SCHEMA_FIELD}: {v}")))?,
    };
    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            what: WHAT,
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for migration in &MIGRATIONS[(version - 1) as usize..] {
        migration(&mut map)?;
    }

    serde_json::from_value(Value::Object(map)).map_err(|e| corrupt(e.to_string()))
}

fn migrate_v1_to_v2(map: &mut Map<String, Value>) -> Result<(), StoreError> {
    if let Some(weights) = map.remove("weather_weights") {
        map.entry("weights").or_insert(weights);
    }

    let means = map.remove("feature_means").unwrap_or_else(|| Value::Array(Vec::new()));
    let stds = map.remove("feature_stds").unwrap_or_else(|| Value::Array(Vec::new()));
    let names = map
        .get("feature_names")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

    let lengths = [&names, &means, &stds].map(|v| v.as_array().map(Vec::len));
    if lengths.iter().any(Option::is_none) {
        return Err(corrupt("v1 scaler fields must be arrays"));
    }

    // v1 stored an empty scaler when the model was trained on raw features
    let fitted = lengths.iter().all(|len| *len == lengths[0]) && lengths[1] != Some(0);
    let scaler = if fitted {
        serde_json::json!({ "feature_names": names, "means": means, "stds": stds })
    } else {
        serde_json::json!({ "feature_names": [], "means": [], "stds": [] })
    };
    map.insert("scaler".to_string(), scaler);

    // v1 had no correction factor
    map.entry("correction_factor").or_insert(Value::from(1.0));
    Ok(())
}

fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        what: WHAT,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn sample_weights() -> LearnedWeights {
        LearnedWeights {
            weights: [("temperature".to_string(), 0.5)].into_iter().collect(),
            bias: 1.25,
            feature_names: vec!["temperature".to_string()],
            accuracy: Some(0.7),
            training_samples: 80,
            last_trained: Some(Utc::now()),
            lambda: Some(0.1),
            ..Default::default()
        }
    }

    #[test]
    fn test_current_version_is_stamped() {
        let weights = sample_weights();
        let value = encode_weights(&weights).unwrap();
        assert_eq!(value[SCHEMA_FIELD], json!(CURRENT_SCHEMA_VERSION));
        assert_eq!(decode_weights(value).unwrap(), weights);
    }

    #[test]
    fn test_v1_document_is_migrated() {
        let v1 = json!({
            "weather_weights": { "temperature": 0.5, "humidity": -0.1 },
            "bias": 2.0,
            "feature_names": ["temperature", "humidity"],
            "feature_means": [15.0, 60.0],
            "feature_stds": [5.0, 10.0],
            "accuracy": 0.65,
            "training_samples": 120,
            "last_trained": "2024-05-01T10:00:00Z",
            "lambda": null
        });

        let weights = decode_weights(v1).unwrap();
        assert_eq!(weights.weights["humidity"], -0.1);
        assert_eq!(weights.scaler.means, vec![15.0, 60.0]);
        assert_eq!(weights.scaler.feature_names, weights.feature_names);
        assert_eq!(weights.correction_factor, 1.0);
        assert!(weights.is_trained());
    }

    #[test]
    fn test_future_version_is_rejected() {
        let err = decode_weights(json!({ "schema_version": 9 })).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 9, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(decode_weights(json!([1, 2])), Err(StoreError::Corrupt { .. })));
        assert!(matches!(
            decode_weights(json!({ "schema_version": 2, "bias": "x" })),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
