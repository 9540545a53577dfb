//! # Delivery Error Taxonomy
//!
//! Errors surfaced by delivery handlers, transports and the record store.
//! Each variant maps to an [`ErrorClass`] that drives retry, circuit breaker
//! and dead-letter decisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification stored with dead-letter records and used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network reset, timeout, rate limit or 5xx from a dependency
    Transient,
    /// Malformed request, invalid target or another 4xx the caller caused
    Client,
    /// Rejected by an open circuit breaker without touching the dependency
    CircuitOpen,
    /// Retry budget used up
    RetryExhausted,
    /// The record store could not persist or fetch
    Persistence,
}

impl ErrorClass {
    /// Whether the queues should schedule another attempt for this class
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::CircuitOpen)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Client => "client",
            ErrorClass::CircuitOpen => "circuit_open",
            ErrorClass::RetryExhausted => "retry_exhausted",
            ErrorClass::Persistence => "persistence",
        };
        f.write_str(label)
    }
}

/// Errors produced while delivering an inbound event or outbound message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Transient dependency failure: {dependency}: {message}")]
    TransientDependency {
        dependency: String,
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },

    #[error("Client error: {message}")]
    Client {
        message: String,
        status: Option<u16>,
    },

    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Persistence error: {operation}: {message}")]
    Persistence { operation: String, message: String },
}

impl DeliveryError {
    /// Create a transient dependency error
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
            code: None,
            status: None,
        }
    }

    /// Create a transient dependency error carrying a transport error code such as `ECONNRESET`
    pub fn transient_with_code(
        dependency: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
            code: Some(code.into()),
            status: None,
        }
    }

    /// Create a transient dependency error from an upstream HTTP status
    pub fn upstream_status(dependency: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
            code: None,
            status: Some(status),
        }
    }

    /// Create a client error
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
            status: None,
        }
    }

    /// Create a client error with the status code the dependency answered with
    pub fn client_status(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a circuit open error
    pub fn circuit_open(component: impl Into<String>) -> Self {
        Self::CircuitOpen {
            component: component.into(),
        }
    }

    /// Create a retry exhausted error
    pub fn retry_exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::RetryExhausted {
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classification of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientDependency { .. } => ErrorClass::Transient,
            Self::Client { .. } => ErrorClass::Client,
            Self::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            Self::RetryExhausted { .. } => ErrorClass::RetryExhausted,
            Self::Persistence { .. } => ErrorClass::Persistence,
        }
    }

    /// Whether a queue should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

/// Error details a circuit breaker inspects when classifying a failure
pub trait FailureDetails: fmt::Display {
    /// Status code returned by the dependency, if any
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Transport or library error code, if any
    fn error_code(&self) -> Option<&str> {
        None
    }

    /// Whether the failure was caused by the caller and must not trip a breaker
    fn is_client_error(&self) -> bool {
        false
    }
}

impl FailureDetails for DeliveryError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::TransientDependency { status, .. } | Self::Client { status, .. } => *status,
            _ => None,
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::TransientDependency { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    fn is_client_error(&self) -> bool {
        matches!(self, Self::Client { .. })
    }
}

impl FailureDetails for String {}

impl FailureDetails for &str {}

/// Result type for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            DeliveryError::transient("whatsapp", "connection reset").class(),
            ErrorClass::Transient
        );
        assert_eq!(DeliveryError::client("bad target").class(), ErrorClass::Client);
        assert_eq!(
            DeliveryError::circuit_open("whatsapp").class(),
            ErrorClass::CircuitOpen
        );
        assert_eq!(
            DeliveryError::persistence("persist", "disk full").class(),
            ErrorClass::Persistence
        );
    }

    #[test]
    fn test_retryable_classes() {
        assert!(DeliveryError::transient("db", "timeout").is_retryable());
        assert!(DeliveryError::circuit_open("db").is_retryable());
        assert!(!DeliveryError::client_status(422, "invalid phone").is_retryable());
        assert!(!DeliveryError::retry_exhausted(5, "boom").is_retryable());
    }

    #[test]
    fn test_failure_details() {
        let err = DeliveryError::transient_with_code("whatsapp", "ECONNRESET", "socket hang up");
        assert_eq!(err.error_code(), Some("ECONNRESET"));
        assert_eq!(err.status_code(), None);

        let err = DeliveryError::client_status(404, "unknown recipient");
        assert_eq!(err.status_code(), Some(404));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_error_display() {
        let err = DeliveryError::circuit_open("whatsapp");
        assert_eq!(err.to_string(), "Circuit breaker is open for whatsapp");
        assert_eq!(ErrorClass::RetryExhausted.to_string(), "retry_exhausted");
    }
}
