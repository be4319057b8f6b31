//! Crate-wide error type.
//!
//! Each public operation declares which of these kinds it may produce, per
//! the error taxonomy: NotFound, InvariantViolation, IOFailure, AnnFailure,
//! EmbeddingFailure, LlmFailure, Busy, Timeout, ConfigurationInvalid.

use crate::search::VectorSearchError;
use crate::storage::StorageError;

/// Top-level engine error.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io failure: {0}")]
    IoFailure(String),

    #[error("ann failure: {0}")]
    AnnFailure(String),

    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("llm failure: {0}")]
    LlmFailure(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => EngineError::NotFound(id),
            StorageError::InvariantViolation(m) => EngineError::InvariantViolation(m),
            StorageError::Database(e) => EngineError::IoFailure(e.to_string()),
            StorageError::Io(e) => EngineError::IoFailure(e.to_string()),
            StorageError::InvalidTimestamp(m) => EngineError::InvariantViolation(m),
            StorageError::Init(m) => EngineError::IoFailure(m),
            StorageError::Ann(e) => e.into(),
            StorageError::Poisoned(m) => EngineError::Busy(m),
        }
    }
}

impl From<VectorSearchError> for EngineError {
    fn from(e: VectorSearchError) -> Self {
        match e {
            VectorSearchError::InvalidDimensions(expected, got) => EngineError::InvariantViolation(format!(
                "vector dimension mismatch: index expects {expected}, got {got}"
            )),
            other => EngineError::AnnFailure(other.to_string()),
        }
    }
}

impl From<crate::embeddings::EmbeddingError> for EngineError {
    fn from(e: crate::embeddings::EmbeddingError) -> Self {
        EngineError::EmbeddingFailure(e.to_string())
    }
}

impl From<crate::cache::CacheError> for EngineError {
    fn from(e: crate::cache::CacheError) -> Self {
        match e {
            crate::cache::CacheError::Cold(err) => EngineError::IoFailure(err.to_string()),
            crate::cache::CacheError::Serde(err) => EngineError::IoFailure(err.to_string()),
            crate::cache::CacheError::Storage(err) => err.into(),
            crate::cache::CacheError::Poisoned(m) => EngineError::Busy(m),
        }
    }
}
