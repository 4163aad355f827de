use std::time::Duration;

use common_database::{is_timeout_error, is_transient_error};

/// Errors surfaced by the stores and the gatekeeper.
///
/// Only `Transient` and `Timeout` are retried, and only by the gatekeeper;
/// everything above it classifies and forwards. Domain outcomes
/// (`UnknownInstance`, `CapacityExceeded`, ...) pass through the retry loop
/// untouched so a capacity rejection is never retried into a different answer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database unavailable (circuit open)")]
    Unavailable { retry_after: Duration },

    #[error("database operation timed out")]
    Timeout,

    #[error("transient database error: {0}")]
    Transient(sqlx::Error),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("instance {instance_id} is {status} and cannot receive assignments")]
    NotEligible {
        instance_id: String,
        status: &'static str,
    },

    #[error("capacity exceeded for {instance_id}: {requested} requested, {capacity} allowed")]
    CapacityExceeded {
        instance_id: String,
        capacity: i64,
        requested: i64,
    },

    #[error("stream {stream_id} is already assigned to {owner}")]
    AlreadyAssigned { stream_id: i64, owner: String },

    #[error("stale heartbeat for {0}")]
    StaleHeartbeat(String),

    #[error("unrecoverable state: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_timeout_error(&e) {
            StoreError::Timeout
        } else if is_transient_error(&e) {
            StoreError::Transient(e)
        } else {
            StoreError::Database(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_classify_by_kind() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Timeout
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(StoreError::Timeout.is_retryable());
        assert!(StoreError::Transient(sqlx::Error::PoolClosed).is_retryable());
        assert!(!StoreError::UnknownInstance("w1".into()).is_retryable());
        assert!(!StoreError::CapacityExceeded {
            instance_id: "w1".into(),
            capacity: 5,
            requested: 6,
        }
        .is_retryable());
        assert!(!StoreError::Unavailable {
            retry_after: Duration::from_secs(60)
        }
        .is_retryable());
    }
}
