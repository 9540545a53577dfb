//! # Dead-Letter Handling
//!
//! Records for items that exhausted their retry budget, the store they are
//! persisted to, and the periodic service that re-attempts them.

pub mod record;
pub mod retry_service;
pub mod store;

pub use record::{DeadLetterId, DeadLetterRecord, DeadLetterStatus};
pub use retry_service::{CycleReport, DeadLetterReplay, DeadLetterRetryService, RetryResult, RetryStats};
pub use store::{DeadLetterCounts, DeadLetterFilter, DeadLetterStore, InMemoryDeadLetterStore};

use crate::error::DeliveryError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("Dead-letter store error: {operation}: {message}")]
    Persistence { operation: String, message: String },

    #[error("Dead-letter record not found: {id}")]
    NotFound { id: String },

    #[error("Dead-letter record {id} is {status} and cannot be retried")]
    NotRetryable { id: String, status: DeadLetterStatus },

    #[error("Unknown dead-letter payload kind: {kind}")]
    UnknownKind { kind: String },
}

impl DeadLetterError {
    /// Create a persistence error
    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }
}

impl From<DeadLetterError> for DeliveryError {
    fn from(err: DeadLetterError) -> Self {
        match err {
            DeadLetterError::Persistence { operation, message } => {
                DeliveryError::Persistence { operation, message }
            }
            DeadLetterError::UnknownKind { kind } => {
                DeliveryError::client(format!("unknown dead-letter payload kind: {kind}"))
            }
            other => DeliveryError::client(other.to_string()),
        }
    }
}

/// Result type for dead-letter operations
pub type DeadLetterResult<T> = Result<T, DeadLetterError>;
