//! Error taxonomy for the storage layer.
//!
//! Every failed operation surfaces exactly one of these kinds so
//! callers can branch deterministically. Raw driver errors are folded
//! into [`DataError::Backend`] and never leak their concrete types.

use std::time::Duration;

use crate::pool::BackendKind;

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Every health-probe retry failed while acquiring a connection.
    #[error("connection pool exhausted for {backend}")]
    PoolExhausted { backend: BackendKind },

    /// The acquire timeout elapsed before a connection freed up.
    #[error("timed out acquiring a {backend} connection after {waited:?}")]
    PoolTimeout {
        backend: BackendKind,
        waited: Duration,
    },

    /// The circuit for a dependency is open; no backend call was made.
    #[error("circuit open for {dependency}, retry in {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// Input failed validation; no backend call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A vector collection is unprovisioned or its spec does not match.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A write landed in a sealed or expired audit partition.
    #[error("audit partition {partition} is sealed")]
    PartitionSealed { partition: String },

    /// Underlying store failure, re-surfaced without internal detail loss.
    #[error("backend error: {0}")]
    Backend(String),

    /// The requested record does not exist (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    /// Build a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        DataError::Validation(reason.into())
    }

    /// Build a not-found error for an entity.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DataError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether this error indicates the backend itself misbehaved.
    ///
    /// Circuit breakers count only these; a validation failure or a
    /// missing row says nothing about the health of a dependency.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            DataError::Backend(_)
                | DataError::PoolTimeout { .. }
                | DataError::PoolExhausted { .. }
        )
    }
}

impl From<tokio_postgres::Error> for DataError {
    fn from(e: tokio_postgres::Error) -> Self {
        DataError::Backend(e.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for DataError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        DataError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::Backend(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failures_feed_the_breaker() {
        assert!(DataError::Backend("boom".into()).is_backend_failure());
        assert!(
            DataError::PoolExhausted {
                backend: BackendKind::KeyValue
            }
            .is_backend_failure()
        );
        assert!(!DataError::validation("bad input").is_backend_failure());
        assert!(!DataError::not_found("user", "42").is_backend_failure());
        assert!(
            !DataError::CircuitOpen {
                dependency: "key-value".into(),
                retry_after: Duration::from_secs(1),
            }
            .is_backend_failure()
        );
    }
}
