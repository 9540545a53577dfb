//! # Messaging Error Types
//!
//! Errors raised by the queues themselves, as opposed to the delivery
//! failures reported by handlers ([`crate::error::DeliveryError`]).

use crate::error::DeliveryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Queue store unavailable: {lane}: {message}")]
    StoreUnavailable { lane: String, message: String },

    #[error("Queue operation failed: {lane}: {operation}: {message}")]
    QueueOperation {
        lane: String,
        operation: String,
        message: String,
    },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Envelope kind mismatch: expected {expected}, found {found}")]
    EnvelopeMismatch { expected: String, found: String },

    #[error("Queue lane has been shut down: {lane}")]
    LaneStopped { lane: String },
}

impl MessagingError {
    /// Create a store unavailable error
    pub fn store_unavailable(lane: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            lane: lane.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        lane: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            lane: lane.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a job not found error
    pub fn job_not_found(job_id: impl ToString) -> Self {
        Self::JobNotFound {
            job_id: job_id.to_string(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create an envelope mismatch error
    pub fn envelope_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::EnvelopeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a lane stopped error
    pub fn lane_stopped(lane: impl Into<String>) -> Self {
        Self::LaneStopped { lane: lane.into() }
    }

    /// Whether the durable store itself is unreachable
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessageSerialization {
            message: err.to_string(),
        }
    }
}

impl From<MessagingError> for DeliveryError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::StoreUnavailable { lane, message } => {
                DeliveryError::transient(format!("job_store:{lane}"), message)
            }
            other => DeliveryError::persistence("queue", other.to_string()),
        }
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let err = MessagingError::store_unavailable("webhook", "redis down");
        assert!(err.is_store_unavailable());
        assert_eq!(err.to_string(), "Queue store unavailable: webhook: redis down");

        let err = MessagingError::queue_operation("message", "clear", "locked");
        assert!(!err.is_store_unavailable());
        assert!(err.to_string().contains("clear"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let err: MessagingError = parse_error.into();
        assert!(matches!(err, MessagingError::MessageSerialization { .. }));
    }
}
