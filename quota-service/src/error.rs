//! Error taxonomy for quota-service.
//!
//! Business outcomes (quota exceeded, rate limited, replays, collisions) are
//! not errors: they come back as a [`QuotaDecision`](crate::models::QuotaDecision).
//! Only the faults below abort an operation.

use service_core::error::AppError;
use thiserror::Error;

/// Structural or semantic defect in a bucket collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketViolation {
    #[error("bucket collection must be an array")]
    NotAnArray,

    #[error("bucket at index {index} is not an object")]
    NotAnObject { index: usize },

    #[error("bucket at index {index} is missing field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("bucket at index {index} has wrong type for field '{field}'")]
    WrongType { index: usize, field: &'static str },

    #[error("bucket at index {index} has an empty id")]
    EmptyId { index: usize },

    #[error("bucket at index {index} has unknown source '{source_name}'")]
    UnknownSource { index: usize, source_name: String },

    #[error("bucket at index {index} has unparseable expires_at '{value}'")]
    BadTimestamp { index: usize, value: String },

    #[error("bucket '{id}' has negative {field}")]
    Negative { id: String, field: &'static str },

    #[error("bucket '{id}' consumed {consumed}s of {seconds}s granted")]
    OverConsumed {
        id: String,
        consumed: i64,
        seconds: i64,
    },

    #[error("bucket id '{id}' is not unique")]
    DuplicateId { id: String },

    #[error("computed totals do not match bucket contents")]
    TotalsMismatch,

    #[error("bucket totals exceed the representable range")]
    TotalsOverflow,
}

#[derive(Debug, Error)]
pub enum QuotaError {
    /// Fatal: the mutation is aborted and nothing is persisted.
    #[error("Invalid bucket state: {0}")]
    InvalidBucketState(#[from] BucketViolation),

    /// Transient: the whole operation must be retried from the start.
    #[error("Serialization conflict, retry the operation")]
    SerializationConflict,

    #[error("Insufficient balance: requested {requested}s, available {available}s")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("No balance exists for user {0}")]
    BalanceNotFound(uuid::Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),
}

impl QuotaError {
    pub fn storage(operation: &str, err: impl std::fmt::Display) -> Self {
        QuotaError::Storage(anyhow::anyhow!("Failed to {}: {}", operation, err))
    }
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::InvalidBucketState(violation) => {
                AppError::IntegrityViolation(anyhow::Error::new(violation))
            }
            QuotaError::SerializationConflict => AppError::ServiceUnavailable(
                "Concurrent update conflict, retry the request".to_string(),
                Some(1),
            ),
            QuotaError::InsufficientBalance { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            QuotaError::BalanceNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            QuotaError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            QuotaError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}
