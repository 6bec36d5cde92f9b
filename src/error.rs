//! Crate-level error taxonomy
//!
//! Only `InitializationFailed` ever reaches a host; the rest are logged and
//! degraded around inside the engine.

use crate::ml::TrainerError;
use crate::repo::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    DataIntegrity,
    ModelUnavailable,
    NumericDependencyMissing,
    PhysicalImplausibility,
    InitializationFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Persisted state is invalid: {0}")]
    DataIntegrity(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Linear algebra backend missing: {0}")]
    NumericDependencyMissing(String),

    #[error("Physically implausible input: {0}")]
    PhysicalImplausibility(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::NumericDependencyMissing(_) => ErrorKind::NumericDependencyMissing,
            Self::PhysicalImplausibility(_) => ErrorKind::PhysicalImplausibility,
            Self::InitializationFailed(_) => ErrorKind::InitializationFailed,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        if err.is_recoverable() {
            Self::DataIntegrity(err.to_string())
        } else {
            Self::InitializationFailed(err.to_string())
        }
    }
}

impl From<TrainerError> for EngineError {
    fn from(err: TrainerError) -> Self {
        match err {
            TrainerError::NumericDependencyMissing => Self::NumericDependencyMissing(err.to_string()),
            TrainerError::InsufficientSamples { .. } => Self::ModelUnavailable(err.to_string()),
            other => Self::DataIntegrity(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
