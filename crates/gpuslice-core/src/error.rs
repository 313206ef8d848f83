//! Error types for gpuslice

use thiserror::Error;

/// Main error type for gpuslice
#[derive(Error, Debug)]
pub enum SliceError {
    /// Referenced workload, node or shared object vanished
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure on write
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// No node/GPU/window combination is free for the requested profile
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// Shared object boot id disagrees with the live node
    #[error("Stale boot id on node {node}: recorded {recorded}, live {live}")]
    StaleBootId {
        node: String,
        recorded: String,
        live: String,
    },

    /// Shared object exists but the node agent has not published a boot id yet
    #[error("Node resources not yet published: {0}")]
    NotPublished(String),

    /// Workload cannot be served (container count, missing profile)
    #[error("Malformed workload: {0}")]
    MalformedWorkload(String),

    /// Request without result or result without request
    #[error("Inconsistent allocation record: {0}")]
    Inconsistent(String),

    /// A dual-status field was asked to move backwards
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Transient object-store error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SliceError {
    /// Whether a later pass may succeed without anything else changing
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SliceError::WriteConflict(_)
                | SliceError::NoCapacity(_)
                | SliceError::StaleBootId { .. }
                | SliceError::NotPublished(_)
                | SliceError::Inconsistent(_)
                | SliceError::Store(_)
        )
    }

    /// Whether the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, SliceError::WriteConflict(_))
    }

    /// Whether the error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, SliceError::NotFound(_))
    }
}

/// Result type for gpuslice operations
pub type SliceResult<T> = Result<T, SliceError>;

impl From<toml::de::Error> for SliceError {
    fn from(err: toml::de::Error) -> Self {
        SliceError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SliceError::NoCapacity("profile 1g.5gb".to_string());
        assert_eq!(err.to_string(), "No capacity: profile 1g.5gb");

        let err = SliceError::StaleBootId {
            node: "node-a".to_string(),
            recorded: "old".to_string(),
            live: "new".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Stale boot id on node node-a: recorded old, live new"
        );
    }

    #[test]
    fn test_error_from_toml() {
        let err: SliceError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, SliceError::Config(_)));
    }

    #[test]
    fn test_retry_classification() {
        assert!(SliceError::WriteConflict("x".into()).is_retryable());
        assert!(SliceError::NoCapacity("x".into()).is_retryable());
        assert!(!SliceError::MalformedWorkload("x".into()).is_retryable());
        assert!(!SliceError::InvalidTransition("x".into()).is_retryable());
        assert!(SliceError::NotFound("x".into()).is_not_found());
        assert!(SliceError::WriteConflict("x".into()).is_conflict());
    }
}
